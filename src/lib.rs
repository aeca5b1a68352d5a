use serde::Serialize;

pub mod mqtt_handler;

// MODULES
pub mod dispatch;
pub mod indicator;
pub mod message_handler;
pub mod telemetry;
pub mod timer;
pub mod tracking;
pub mod watchdog;

/// A message to be sent
#[derive(std::fmt::Debug)]
pub struct PublishableMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// the prediction label the classifier publishes for an anomalous route
pub const ABNORMAL_LABEL: &str = "abnormal";

/// the same label as published by the in-vehicle classifier
pub const ABNORMAL_LABEL_KO: &str = "비정상";

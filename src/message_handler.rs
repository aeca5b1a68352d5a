use tokio::sync::mpsc::{error::TrySendError, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    indicator::{LightAction, ALERT_BLINK},
    telemetry::{DecodeError, TelemetryMessage},
    tracking::TrackingState,
};

/// gas readings above this blink the gas light
pub const DEFAULT_GAS_THRESHOLD: f64 = 800.0;

/// Consumes inbound telemetry payloads
/// - records each decoded message into the tracking state
/// - drives the route light from the prediction and the gas light from `mq_value`
pub struct MessageHandler {
    state: TrackingState,
    gas_threshold: f64,
    gas_light_tx: Option<Sender<LightAction>>,
    route_light_tx: Option<Sender<LightAction>>,
}

impl MessageHandler {
    pub fn new(state: TrackingState, gas_threshold: f64) -> Self {
        MessageHandler {
            state,
            gas_threshold,
            gas_light_tx: None,
            route_light_tx: None,
        }
    }

    pub fn with_lights(
        mut self,
        gas_light_tx: Sender<LightAction>,
        route_light_tx: Sender<LightAction>,
    ) -> Self {
        self.gas_light_tx = Some(gas_light_tx);
        self.route_light_tx = Some(route_light_tx);
        self
    }

    /// Handles one payload.  A payload which fails to decode leaves the state untouched.
    pub fn handle(&self, payload: &[u8]) -> Result<TelemetryMessage, DecodeError> {
        let msg = TelemetryMessage::decode(payload)?;
        trace!("Received telemetry: {:?}", msg);

        self.state.record_message(&msg);

        if let Some(prediction) = &msg.prediction {
            if prediction.is_abnormal() {
                warn!("Abnormal route detected ({})", prediction.label());
                send_light(&self.route_light_tx, ALERT_BLINK);
            }
        }
        if let Some(mq_value) = msg.mq_value {
            if mq_value > self.gas_threshold {
                warn!("MQ value {} exceeds threshold {}", mq_value, self.gas_threshold);
                send_light(&self.gas_light_tx, ALERT_BLINK);
            } else {
                send_light(&self.gas_light_tx, LightAction::Off);
            }
        }
        Ok(msg)
    }
}

/// never waits, a busy light just misses the action
fn send_light(light_tx: &Option<Sender<LightAction>>, action: LightAction) {
    let Some(light_tx) = light_tx else {
        return;
    };
    match light_tx.try_send(action) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!("Light busy, dropping {:?}", action),
        Err(TrySendError::Closed(_)) => warn!("Light channel closed!"),
    }
}

/// Runs the handler over the inbound payload channel, in arrival order
pub async fn message_handler(
    cancel_token: CancellationToken,
    mut payload_rx: Receiver<Vec<u8>>,
    handler: MessageHandler,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down message handler!");
                break;
            },
            payload = payload_rx.recv() => {
                let Some(payload) = payload else {
                    warn!("Payload channel closed, stopping message handler");
                    break;
                };
                if let Err(err) = handler.handle(&payload) {
                    warn!("Discarding message: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::Coordinate;

    #[tokio::test(start_paused = true)]
    async fn discarded_payload_leaves_state_unchanged() {
        let state = TrackingState::new();
        let handler = MessageHandler::new(state.clone(), DEFAULT_GAS_THRESHOLD);
        handler
            .handle(br#"{"timestamp":"2024-11-02 13:05:09","latitude":37.5,"longitude":127.0,"prediction":"abnormal"}"#)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let before = state.view();
        let bad_payloads: [&[u8]; 4] = [
            br#"{"mq_value": "oops""#,
            br#"not json"#,
            br#"{"latitude":1.0,"longitude":1.0,"prediction":"normal"}"#,
            br#"{"timestamp":"yesterday","prediction":"normal"}"#,
        ];
        for bad in bad_payloads {
            assert!(handler.handle(bad).is_err());
        }
        assert_eq!(state.view(), before);
        assert_eq!(state.snapshot().silence, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn lights_follow_message_contents() {
        let state = TrackingState::new();
        let (gas_tx, mut gas_rx) = mpsc::channel(8);
        let (route_tx, mut route_rx) = mpsc::channel(8);
        let handler = MessageHandler::new(state.clone(), DEFAULT_GAS_THRESHOLD)
            .with_lights(gas_tx, route_tx);

        handler
            .handle(br#"{"timestamp":"2024-11-02 13:05:09","mq_value":912.0,"prediction":"abnormal"}"#)
            .unwrap();
        assert_eq!(gas_rx.try_recv().unwrap(), ALERT_BLINK);
        assert_eq!(route_rx.try_recv().unwrap(), ALERT_BLINK);

        handler
            .handle(br#"{"timestamp":"2024-11-02 13:05:10","mq_value":300.0,"prediction":"normal"}"#)
            .unwrap();
        assert_eq!(gas_rx.try_recv().unwrap(), LightAction::Off);
        assert!(route_rx.try_recv().is_err());

        handler
            .handle(br#"{"timestamp":"2024-11-02 13:05:11","latitude":37.5,"longitude":127.0}"#)
            .unwrap();
        assert!(gas_rx.try_recv().is_err());
        assert_eq!(
            state.last_location(),
            Some(Coordinate {
                latitude: 37.5,
                longitude: 127.0
            })
        );
    }

    #[tokio::test]
    async fn handler_task_drains_channel_in_order() {
        let state = TrackingState::new();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(message_handler(
            token.clone(),
            rx,
            MessageHandler::new(state.clone(), DEFAULT_GAS_THRESHOLD),
        ));

        tx.send(br#"{"timestamp":"2024-11-02 13:05:09","prediction":"abnormal"}"#.to_vec())
            .await
            .unwrap();
        tx.send(br#"{"timestamp": "#.to_vec()).await.unwrap();
        tx.send(
            br#"{"timestamp":"2024-11-02 13:05:10","latitude":35.1,"longitude":129.0,"prediction":"normal"}"#
                .to_vec(),
        )
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();
        assert!(!state.snapshot().anomaly);
        assert_eq!(
            state.last_location(),
            Some(Coordinate {
                latitude: 35.1,
                longitude: 129.0
            })
        );
    }
}

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Local;
use reqwest::{header::AUTHORIZATION, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

use crate::{
    telemetry::TIMESTAMP_FORMAT, timer::FireFuture, tracking::LocationCallback, Coordinate,
    PublishableMessage,
};

/// Failures of a park action.  None of these are retried.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no location was ever recorded")]
    MissingLocation,
    #[error("proximity search failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("could not encode parked event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A point of interest as returned by the keyword search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub place_name: String,
    #[serde(default)]
    pub address_name: String,
    /// metres from the search centre, as reported by the API
    #[serde(default)]
    pub distance: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    documents: Vec<Place>,
}

/// The proximity search collaborator
pub trait PlaceSearch: Send + Sync + 'static {
    fn search(
        &self,
        at: Coordinate,
        radius_m: u32,
    ) -> impl Future<Output = Result<Vec<Place>, DispatchError>> + Send;
}

/// keyword search options, these are static immutable settings
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// URL of the keyword search endpoint
    pub url: String,
    /// REST API key, sent as `KakaoAK <key>`
    pub api_key: String,
    /// the keyword to search around the parked location
    pub query: String,
    /// maximum number of places returned
    pub size: u32,
    pub timeout: Duration,
}

/// Keyword search against the Kakao local API
pub struct KakaoSearch {
    client: Client,
    opts: SearchOptions,
}

impl KakaoSearch {
    pub fn new(opts: SearchOptions) -> Result<Self, DispatchError> {
        let client = Client::builder().timeout(opts.timeout).build()?;
        Ok(KakaoSearch { client, opts })
    }
}

impl PlaceSearch for KakaoSearch {
    async fn search(&self, at: Coordinate, radius_m: u32) -> Result<Vec<Place>, DispatchError> {
        let res = self
            .client
            .get(&self.opts.url)
            .header(AUTHORIZATION, format!("KakaoAK {}", self.opts.api_key))
            .query(&[
                ("query", self.opts.query.clone()),
                ("x", at.longitude.to_string()),
                ("y", at.latitude.to_string()),
                ("radius", radius_m.to_string()),
                ("size", self.opts.size.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: SearchResponse = res.json().await?;
        Ok(body.documents)
    }
}

/// Published when the vehicle is judged parked
#[derive(Debug, Serialize)]
pub struct ParkedEvent<'a> {
    pub location: Coordinate,
    pub radius_m: u32,
    pub triggered_at: String,
    pub places: &'a [Place],
}

/// Runs the park action once per fired session
pub struct ActionDispatcher<S> {
    search: S,
    radius_m: u32,
    publisher: Option<(String, Sender<PublishableMessage>)>,
}

impl<S: PlaceSearch> ActionDispatcher<S> {
    pub fn new(search: S, radius_m: u32) -> Self {
        ActionDispatcher {
            search,
            radius_m,
            publisher: None,
        }
    }

    /// Also publish a `ParkedEvent` on `topic` after every search that found places
    pub fn with_publisher(mut self, topic: String, mqtt_sender_tx: Sender<PublishableMessage>) -> Self {
        self.publisher = Some((topic, mqtt_sender_tx));
        self
    }

    /// Performs the park action.  Errors are logged here and go no further.
    pub async fn dispatch(&self, location: Option<Coordinate>) {
        info!("Park timer elapsed, vehicle judged parked");
        match self.run(location).await {
            Ok(places) if places.is_empty() => {
                info!("No places found around the parked location");
            }
            Ok(places) => {
                info!("Found {} places around the parked location", places.len());
            }
            Err(DispatchError::MissingLocation) => {
                warn!("Park timer fired with no recorded location, skipping search");
            }
            Err(err) => {
                warn!("Park action failed: {}", err);
            }
        }
    }

    /// Searches around `location` and publishes the result
    pub async fn run(&self, location: Option<Coordinate>) -> Result<Vec<Place>, DispatchError> {
        let location = location.ok_or(DispatchError::MissingLocation)?;
        let places = self.search.search(location, self.radius_m).await?;
        for place in &places {
            info!(
                "- {} | {} | {}m",
                place.place_name, place.address_name, place.distance
            );
        }

        if let Some((topic, mqtt_sender_tx)) = &self.publisher {
            if !places.is_empty() {
                let event = ParkedEvent {
                    location,
                    radius_m: self.radius_m,
                    triggered_at: Local::now().format(TIMESTAMP_FORMAT).to_string(),
                    places: &places,
                };
                let payload = serde_json::to_vec(&event)?;
                if let Err(err) = mqtt_sender_tx
                    .send(PublishableMessage {
                        topic: topic.clone(),
                        payload,
                    })
                    .await
                {
                    warn!("Could not queue parked event: {}", err);
                }
            }
        }
        Ok(places)
    }

    /// Wraps this dispatcher as the fire callback of a timer session
    pub fn into_callback(self: Arc<Self>) -> LocationCallback {
        Arc::new(move |location| -> FireFuture {
            let dispatcher = self.clone();
            Box::pin(async move { dispatcher.dispatch(location).await })
        })
    }
}

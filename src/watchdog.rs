use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::tracking::{LocationCallback, TrackingState};

/// Timing of park detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// how long the vehicle must be silent while anomalous before a timer starts
    pub silence_threshold: Duration,
    /// how long the timer runs before the vehicle is judged parked
    pub timer_duration: Duration,
    /// how often the tracking state is polled
    pub poll_period: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_secs(20),
            timer_duration: Duration::from_secs(300),
            poll_period: Duration::from_secs(1),
        }
    }
}

/// Polls the tracking state and starts a park timer once per silence episode.
/// On cancellation, cancels and reaps every session before returning.
/// * `on_fire` - the park action, run by a session that completes
pub async fn watchdog_runner(
    cancel_token: CancellationToken,
    state: TrackingState,
    on_fire: LocationCallback,
    config: WatchdogConfig,
) {
    let mut tick = interval(config.poll_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_state = None;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down watchdog!");
                shutdown_sessions(&state).await;
                break;
            },
            _ = tick.tick() => {
                let snapshot = state.snapshot();
                let current = snapshot.state(config.silence_threshold);
                if last_state != Some(current) {
                    debug!("Watchdog state {:?} -> {:?}", last_state, current);
                    last_state = Some(current);
                }

                if snapshot.should_start(config.silence_threshold)
                    && state.try_start_after_silence(
                        config.silence_threshold,
                        config.timer_duration,
                        on_fire.clone(),
                    )
                {
                    info!("Silent for {:?} while abnormal", snapshot.silence);
                }
                state.prune_retired();
            }
        }
    }
}

/// Cancels every session the state still holds and waits for their tasks
pub async fn shutdown_sessions(state: &TrackingState) {
    for session in state.take_sessions() {
        if session.cancel() {
            info!("Cancelled park timer on shutdown");
        }
        session.join().await;
    }
}

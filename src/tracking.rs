use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    telemetry::TelemetryMessage,
    timer::{FireCallback, FireFuture, TimerSession},
    Coordinate,
};

/// Invoked by a fired session with the location known at the fire instant
pub type LocationCallback = Arc<dyn Fn(Option<Coordinate>) -> FireFuture + Send + Sync>;

/// A consistent read of everything the watchdog decides on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchdogSnapshot {
    pub anomaly: bool,
    pub silence: Duration,
    pub timer_active: bool,
    /// a session already fired for the current silence episode
    pub episode_spent: bool,
}

/// Where the vehicle sits in the park detection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Normal,
    AnomalousActive,
    AnomalousSilent,
    TimerRunning,
    Triggered,
}

impl WatchdogSnapshot {
    pub fn should_start(&self, silence_threshold: Duration) -> bool {
        self.anomaly && self.silence >= silence_threshold && !self.timer_active && !self.episode_spent
    }

    pub fn state(&self, silence_threshold: Duration) -> WatchdogState {
        if self.timer_active {
            WatchdogState::TimerRunning
        } else if !self.anomaly {
            WatchdogState::Normal
        } else if self.episode_spent {
            WatchdogState::Triggered
        } else if self.silence >= silence_threshold {
            WatchdogState::AnomalousSilent
        } else {
            WatchdogState::AnomalousActive
        }
    }
}

/// Plain copy of the tracked fields, for comparison and display
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingView {
    pub last_message_at: Instant,
    pub last_location: Option<Coordinate>,
    pub anomaly: bool,
    pub episode_spent: bool,
    pub session_id: Option<u64>,
}

struct TrackingInner {
    last_message_at: Instant,
    last_location: Option<Coordinate>,
    anomaly: bool,
    episode_spent: bool,
    session: Option<TimerSession>,
    /// sessions detached from `session` whose tasks may still be running
    retired: Vec<TimerSession>,
    next_session_id: u64,
}

/// The shared, synchronized tracking state.  Cheap to clone, every clone is the same state.
///
/// Every operation takes the one lock for its whole duration and never awaits while holding it.
#[derive(Clone)]
pub struct TrackingState {
    inner: Arc<Mutex<TrackingInner>>,
}

impl Default for TrackingState {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingState {
    /// Creates the state with the silence clock starting now
    pub fn new() -> Self {
        TrackingState {
            inner: Arc::new(Mutex::new(TrackingInner {
                last_message_at: Instant::now(),
                last_location: None,
                anomaly: false,
                episode_spent: false,
                session: None,
                retired: Vec::new(),
                next_session_id: 0,
            })),
        }
    }

    /// Records a decoded message.  Returns true if this call cancelled a running session.
    pub fn record_message(&self, msg: &TelemetryMessage) -> bool {
        let mut inner = self.inner.lock();
        inner.last_message_at = Instant::now();
        inner.episode_spent = false;
        if let Some(location) = msg.location {
            inner.last_location = Some(location);
        }
        if let Some(prediction) = &msg.prediction {
            inner.anomaly = prediction.is_abnormal();
        }

        let Some(session) = inner.session.take() else {
            return false;
        };
        let cancelled = session.cancel();
        if cancelled {
            info!("Message received, stopping park timer");
        }
        inner.retired.push(session);
        cancelled
    }

    pub fn snapshot(&self) -> WatchdogSnapshot {
        let inner = self.inner.lock();
        WatchdogSnapshot {
            anomaly: inner.anomaly,
            silence: Instant::now().saturating_duration_since(inner.last_message_at),
            timer_active: inner.session.is_some(),
            episode_spent: inner.episode_spent,
        }
    }

    pub fn view(&self) -> TrackingView {
        let inner = self.inner.lock();
        TrackingView {
            last_message_at: inner.last_message_at,
            last_location: inner.last_location,
            anomaly: inner.anomaly,
            episode_spent: inner.episode_spent,
            session_id: inner.session.as_ref().map(TimerSession::id),
        }
    }

    pub fn last_location(&self) -> Option<Coordinate> {
        self.inner.lock().last_location
    }

    /// Starts a session unless one is already active.  Returns whether a new session was started.
    pub fn try_start_timer(&self, duration: Duration, on_fire: LocationCallback) -> bool {
        let mut inner = self.inner.lock();
        if inner.session.is_some() {
            return false;
        }
        self.start_locked(&mut inner, duration, on_fire);
        true
    }

    /// Starts a session only if the full park condition holds at this instant:
    /// anomalous, silent for at least `silence_threshold`, no session, episode not yet spent.
    pub fn try_start_after_silence(
        &self,
        silence_threshold: Duration,
        duration: Duration,
        on_fire: LocationCallback,
    ) -> bool {
        let mut inner = self.inner.lock();
        let silence = Instant::now().saturating_duration_since(inner.last_message_at);
        if !inner.anomaly
            || silence < silence_threshold
            || inner.session.is_some()
            || inner.episode_spent
        {
            return false;
        }
        self.start_locked(&mut inner, duration, on_fire);
        true
    }

    /// Detaches the active session and every retired one, for shutdown
    pub fn take_sessions(&self) -> Vec<TimerSession> {
        let mut inner = self.inner.lock();
        let mut sessions = std::mem::take(&mut inner.retired);
        sessions.extend(inner.session.take());
        sessions
    }

    /// Drops retired sessions whose tasks have finished
    pub fn prune_retired(&self) {
        self.inner.lock().retired.retain(|s| !s.is_finished());
    }

    fn start_locked(&self, inner: &mut TrackingInner, duration: Duration, on_fire: LocationCallback) {
        let id = inner.next_session_id;
        inner.next_session_id += 1;

        let state = Arc::downgrade(&self.inner);
        let callback: FireCallback = Arc::new(move || -> FireFuture {
            let state = state.clone();
            let on_fire = on_fire.clone();
            Box::pin(async move {
                let Some(location) = complete_session(&state, id) else {
                    debug!("Session {} fired after its tracking state was dropped", id);
                    return;
                };
                on_fire(location).await;
            })
        });
        inner.session = Some(TimerSession::start(id, duration, callback));
        info!("No messages received, park timer started for {:?}", duration);
    }
}

/// Retires a fired session and re-reads the location at the fire instant.
/// None if the state is gone.
fn complete_session(state: &Weak<Mutex<TrackingInner>>, id: u64) -> Option<Option<Coordinate>> {
    let state = state.upgrade()?;
    let mut inner = state.lock();
    if inner.session.as_ref().is_some_and(|s| s.id() == id) {
        if let Some(session) = inner.session.take() {
            inner.retired.push(session);
        }
        inner.episode_spent = true;
    } else {
        debug!("Fired session {} was already detached by a message", id);
    }
    Some(inner.last_location)
}

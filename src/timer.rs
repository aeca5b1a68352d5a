use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// The work a session performs when its countdown completes
pub type FireFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type FireCallback = Arc<dyn Fn() -> FireFuture + Send + Sync>;

/// how often a running countdown wakes up to report its remaining time
const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Lifecycle of a session.  `Fired` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Armed,
    Fired,
    Cancelled,
}

/// A cancelable countdown which runs its callback at most once.
///
/// The phase lock is the only arbiter between the countdown reaching zero and a
/// concurrent `cancel`: whichever claims the `Armed` phase first decides the outcome.
pub struct TimerSession {
    id: u64,
    duration: Duration,
    started_at: Instant,
    phase: Arc<Mutex<Phase>>,
    cancel_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    on_fire: FireCallback,
}

impl TimerSession {
    /// Begins a countdown of `duration` from now.  Must be called from within a tokio runtime.
    pub fn start(id: u64, duration: Duration, on_fire: FireCallback) -> Self {
        let (started_at, phase, cancel_token, handle) = spawn_countdown(id, duration, &on_fire);

        TimerSession {
            id,
            duration,
            started_at,
            phase,
            cancel_token,
            handle: Some(handle),
            on_fire,
        }
    }

    /// Cancels the countdown if it has not fired yet.
    /// Returns true only for the call that moved the session out of `Armed`.
    /// Once this returns true the callback will never run.
    pub fn cancel(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase != Phase::Armed {
            return false;
        }
        *phase = Phase::Cancelled;
        self.cancel_token.cancel();
        debug!(
            "Timer session {} cancelled after {:?}",
            self.id,
            self.started_at.elapsed()
        );
        true
    }

    /// Cancels this countdown and starts a fresh one from now, keeping id, duration and callback
    pub async fn reset(&mut self) {
        self.cancel();
        self.reap().await;

        let (started_at, phase, cancel_token, handle) =
            spawn_countdown(self.id, self.duration, &self.on_fire);
        self.started_at = started_at;
        self.phase = phase;
        self.cancel_token = cancel_token;
        self.handle = Some(handle);
    }

    /// Waits for the countdown task to finish, including any callback already in flight
    pub async fn join(mut self) {
        self.reap().await;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    pub fn is_armed(&self) -> bool {
        self.phase() == Phase::Armed
    }

    /// true once the countdown task, and any callback it ran, has completed
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    async fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!("Timer session {} task failed: {}", self.id, err);
            }
        }
    }
}

impl Drop for TimerSession {
    fn drop(&mut self) {
        // a dropped session must never fire later
        self.cancel();
    }
}

fn spawn_countdown(
    id: u64,
    duration: Duration,
    on_fire: &FireCallback,
) -> (Instant, Arc<Mutex<Phase>>, CancellationToken, JoinHandle<()>) {
    let phase = Arc::new(Mutex::new(Phase::Armed));
    let cancel_token = CancellationToken::new();
    let started_at = Instant::now();
    let handle = tokio::spawn(countdown(
        id,
        started_at + duration,
        phase.clone(),
        cancel_token.clone(),
        on_fire.clone(),
    ));
    debug!("Timer session {} started for {:?}", id, duration);
    (started_at, phase, cancel_token, handle)
}

async fn countdown(
    id: u64,
    deadline: Instant,
    phase: Arc<Mutex<Phase>>,
    cancel_token: CancellationToken,
    on_fire: FireCallback,
) {
    let mut tick = time::interval(COUNTDOWN_TICK);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                trace!("Timer session {} countdown stopped", id);
                return;
            },
            _ = time::sleep_until(deadline) => break,
            _ = tick.tick() => {
                let remaining = deadline.saturating_duration_since(Instant::now()).as_secs();
                trace!("Timer session {} remaining {:02}:{:02}", id, remaining / 60, remaining % 60);
            }
        }
    }

    {
        let mut phase = phase.lock();
        if *phase != Phase::Armed {
            return;
        }
        *phase = Phase::Fired;
    }
    debug!("Timer session {} fired", id);
    on_fire().await;
}

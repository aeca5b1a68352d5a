use std::{path::PathBuf, time::Duration};

use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// What an indicator light should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightAction {
    Off,
    /// `times` on/off cycles, each half of `period` lit
    Blink { times: u8, period: Duration },
}

/// the pattern shown for an abnormal route or a high gas reading
pub const ALERT_BLINK: LightAction = LightAction::Blink {
    times: 4,
    period: Duration::from_millis(500),
};

/// A sysfs LED.  With no path every write is only logged.
pub struct Led {
    name: &'static str,
    brightness: Option<PathBuf>,
}

impl Led {
    /// * `led_dir` - the LED class directory, ex. /sys/class/leds/gas
    pub fn new(name: &'static str, led_dir: Option<PathBuf>) -> Self {
        Led {
            name,
            brightness: led_dir.map(|dir| dir.join("brightness")),
        }
    }

    pub async fn set(&self, on: bool) {
        trace!("LED {} -> {}", self.name, on);
        let Some(path) = &self.brightness else {
            return;
        };
        if let Err(err) = tokio::fs::write(path, if on { "1" } else { "0" }).await {
            warn!("Could not write to LED {}! {}", self.name, err);
        }
    }
}

/**
 * Runs one indicator light, executing actions in arrival order.
 * A blink in progress is cut short on cancellation, and the light is left off on exit.
 */
pub async fn indicator_manager(
    cancel_token: CancellationToken,
    mut light_rx: Receiver<LightAction>,
    led: Led,
) {
    led.set(false).await;
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Shutting down LED {}", led.name);
                break;
            },
            action = light_rx.recv() => match action {
                Some(LightAction::Off) => led.set(false).await,
                Some(LightAction::Blink { times, period }) => {
                    if !blink(&cancel_token, &led, times, period).await {
                        break;
                    }
                },
                None => break,
            }
        }
    }
    led.set(false).await;
}

/// returns false if cancelled part way
async fn blink(cancel_token: &CancellationToken, led: &Led, times: u8, period: Duration) -> bool {
    let half = period / 2;
    for _ in 0..times {
        for on in [true, false] {
            led.set(on).await;
            tokio::select! {
                _ = cancel_token.cancelled() => return false,
                _ = tokio::time::sleep(half) => {}
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;
    use tokio::sync::mpsc;

    use super::*;

    fn brightness(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("brightness")).unwrap()
    }

    #[tokio::test]
    async fn follows_actions_and_ends_dark() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(indicator_manager(
            token.clone(),
            rx,
            Led::new("test", Some(dir.path().to_path_buf())),
        ));

        tx.send(LightAction::Blink {
            times: 2,
            period: Duration::from_millis(2),
        })
        .await
        .unwrap();
        tx.send(LightAction::Off).await.unwrap();
        // closing the channel drains the queue then stops the manager
        drop(tx);
        task.await.unwrap();
        assert_eq!(brightness(dir.path()), "0");
    }

    #[tokio::test]
    async fn cancel_interrupts_blink() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(indicator_manager(
            token.clone(),
            rx,
            Led::new("test", Some(dir.path().to_path_buf())),
        ));

        tx.send(LightAction::Blink {
            times: 200,
            period: Duration::from_secs(1),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("manager did not stop")
            .unwrap();
        assert_eq!(brightness(dir.path()), "0");
    }

    #[tokio::test]
    async fn no_path_is_log_only() {
        let led = Led::new("virtual", None);
        led.set(true).await;
        led.set(false).await;
    }
}

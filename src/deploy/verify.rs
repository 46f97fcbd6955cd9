use log::{debug, warn};
use std::time::{Duration, Instant};

/// How long to keep re-reading host state after a change before declaring it
/// unverified. Some hosts apply binding updates asynchronously.
#[derive(Debug, Clone, Copy)]
pub struct VerifyPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(500),
        }
    }
}

impl VerifyPolicy {
    /// Single read, no waiting.
    pub fn immediate() -> Self {
        Self {
            timeout: Duration::ZERO,
            interval: Duration::ZERO,
        }
    }
}

/// Re-runs `check` until it returns `Ok(true)` or the timeout elapses.
///
/// The closure should return:
/// - `Ok(true)` once the expected state is observed
/// - `Ok(false)` if the state should be read again
/// - `Err(_)` to stop immediately
///
/// Returns `Ok(false)` on timeout so the caller can report what it last saw.
pub fn wait_until<E, F>(
    target: &str,
    operation: &str,
    policy: VerifyPolicy,
    mut check: F,
) -> Result<bool, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Result<bool, E>,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            "[verify] {} check attempt {} for {}",
            operation, attempt, target
        );

        match check() {
            Ok(true) => {
                debug!(
                    "[verify] {} confirmed for {} after {}ms (attempt {})",
                    operation,
                    target,
                    started.elapsed().as_millis(),
                    attempt
                );
                return Ok(true);
            }
            Ok(false) => {
                if started.elapsed() >= policy.timeout {
                    warn!(
                        "[verify] {} not confirmed for {} after {}ms (attempt {})",
                        operation,
                        target,
                        started.elapsed().as_millis(),
                        attempt
                    );
                    return Ok(false);
                }
                std::thread::sleep(policy.interval);
            }
            Err(err) => {
                warn!("[verify] {} check for {} failed: {}", operation, target, err);
                return Err(err);
            }
        }
    }
}

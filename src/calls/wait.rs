use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

const MIN_STEP: Duration = Duration::from_millis(1);

/// Polls `ready` every `step` until it returns true or `timeout` elapses.
///
/// The condition is checked once immediately and once more at the deadline,
/// so a condition that becomes true at time `t < timeout` is observed no
/// later than one step after `t`.
pub async fn wait_with_timeout<F, Fut>(timeout: Duration, step: Duration, mut ready: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let step = step.max(MIN_STEP);
    let deadline = Instant::now() + timeout;
    loop {
        if ready().await {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(step.min(deadline - now)).await;
    }
}

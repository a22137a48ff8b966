use std::time::{Duration, Instant};

use thiserror::Error;

/// The polled condition did not become true within the allotted time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("condition not met within {0:?}")]
pub struct PollTimeout(pub Duration);

/// Spin-polls `cond` until it returns `true` or `timeout` elapses.
///
/// The condition is evaluated at least once, so a zero timeout degenerates to a single check.
/// After a short burst of busy spinning the loop yields to the scheduler between checks.
pub fn poll_timeout(timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<(), PollTimeout> {
    const SPINS_BEFORE_YIELD: u32 = 64;

    let start = Instant::now();
    let mut spins = 0u32;
    loop {
        if cond() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(PollTimeout(timeout));
        }
        if spins < SPINS_BEFORE_YIELD {
            spins += 1;
            core::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

//! Shared fixtures for the RMEM integration tests.

pub mod fixtures;

use std::time::{Duration, Instant};

/// Check if running in CI environment
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok() || std::env::var("GITHUB_ACTIONS").is_ok()
}

/// Scale a timeout for slower CI machines
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout * 3
    } else {
        base_timeout
    }
}

/// Poll `condition` until it holds or `timeout` (CI-scaled) elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + ci_timeout(timeout);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

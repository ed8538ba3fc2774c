//! Bounded polling for the VM and node state machines

use crate::error::{Result, ScalerError};
use crate::settings::PollSettings;
use std::future::Future;
use tracing::debug;

/// Call `probe` until it yields a value, sleeping `policy.interval()` between
/// attempts. Probe errors abort the wait immediately.
pub async fn poll_until<T, F, Fut>(what: &str, policy: PollSettings, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=policy.max_attempts {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        debug!(what = %what, attempt, max_attempts = policy.max_attempts, "Still waiting");
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval()).await;
        }
    }

    Err(ScalerError::Timeout {
        what: what.to_string(),
        attempts: policy.max_attempts,
        interval: policy.interval(),
    })
}

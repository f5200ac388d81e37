// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-interval polling for conditions that become true asynchronously.

use crate::retry::RetryPolicy;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Result of one evaluation of a polled condition.
#[derive(Debug)]
pub enum CondCheckError<E> {
    /// The condition does not hold yet; poll again after the interval.
    NotYet,
    /// The condition can never hold; stop polling immediately.
    Failed(E),
}

impl<E> From<E> for CondCheckError<E> {
    fn from(e: E) -> Self {
        CondCheckError::Failed(e)
    }
}

/// Error from [`wait_for_condition`].
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("condition did not hold within {:?}", .0)]
    TimedOut(Duration),
    #[error("condition failed permanently")]
    PermanentError(#[source] E),
}

impl<E> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut(_))
    }
}

/// Poll `cond` every `policy.interval` until it succeeds, fails permanently,
/// or `policy.max_wait` has elapsed.
///
/// The condition is always evaluated at least once, even with a zero
/// `max_wait`. Elapsed time is measured from before the first evaluation, so
/// a condition that itself blocks for longer than `max_wait` still gets only
/// that one attempt.
pub async fn wait_for_condition<T, E, Func, Fut>(
    mut cond: Func,
    policy: &RetryPolicy,
) -> Result<T, PollError<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CondCheckError<E>>>,
{
    let start = Instant::now();
    loop {
        match cond().await {
            Ok(value) => return Ok(value),
            Err(CondCheckError::Failed(e)) => {
                return Err(PollError::PermanentError(e));
            }
            Err(CondCheckError::NotYet) => {
                if start.elapsed() >= policy.max_wait {
                    return Err(PollError::TimedOut(policy.max_wait));
                }
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layered readiness probing of a freshly installed cluster.
//!
//! Checks run strictly in sequence because each one assumes everything
//! before it already holds (no point asking the scheduler for workers
//! before the front door answers). Each check retries on its own
//! fixed-interval policy; the whole sequence runs under one wall-clock
//! deadline that cancels outstanding polling when it fires.

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, info, o, Logger};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use windlass_common::poll::{
    wait_for_condition, CondCheckError, PollError,
};
use windlass_common::retry::RetryPolicy;

pub mod http;

pub use http::{standard_checks, ClusterClient, Credentials, Expectations};

/// Errors produced by a check's probe.
pub type CheckError = Box<dyn std::error::Error + Send + Sync>;

type Predicate =
    Box<dyn FnMut() -> BoxFuture<'static, Result<(), CheckError>> + Send>;

/// One named, independently retried probe of the cluster's health.
pub struct ReadinessCheck {
    name: String,
    policy: RetryPolicy,
    /// When set, a probe error aborts the whole sequence instead of
    /// counting as "not ready yet".
    failure_is_fatal: bool,
    predicate: Predicate,
}

impl ReadinessCheck {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        policy: RetryPolicy,
        mut predicate: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CheckError>> + Send + 'static,
    {
        ReadinessCheck {
            name: name.into(),
            policy,
            failure_is_fatal: false,
            predicate: Box::new(move || predicate().boxed()),
        }
    }

    pub fn fatal_on_error(mut self) -> Self {
        self.failure_is_fatal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error(
        "cluster did not become ready within {deadline:?} \
         (last outstanding check: {last_check})"
    )]
    DeadlineExceeded { deadline: Duration, last_check: String },

    #[error("readiness check {check} did not pass within {waited:?}")]
    CheckTimedOut { check: String, waited: Duration },

    #[error("readiness check {check} failed")]
    CheckFailed {
        check: String,
        #[source]
        source: CheckError,
    },

    #[error("building the probe HTTP client")]
    Client(#[source] reqwest::Error),
}

pub struct Prober {
    deadline: Duration,
    log: Logger,
}

impl Prober {
    /// Default bound on the whole readiness sequence.
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60 * 60);

    pub fn new(log: &Logger) -> Self {
        Self::with_deadline(log, Self::DEFAULT_DEADLINE)
    }

    pub fn with_deadline(log: &Logger, deadline: Duration) -> Self {
        Prober {
            deadline,
            log: log.new(o!("component" => "Prober")),
        }
    }

    /// Run `checks` in order until all pass.
    ///
    /// Returns [`ReadinessError::DeadlineExceeded`] if the overall
    /// deadline fires first; this cancels whatever check is mid-retry.
    pub async fn wait_until_ready(
        &self,
        checks: Vec<ReadinessCheck>,
    ) -> Result<(), ReadinessError> {
        let last_check = Arc::new(Mutex::new(String::new()));
        let sequence = self.run_sequence(checks, Arc::clone(&last_check));
        match tokio::time::timeout(self.deadline, sequence).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ReadinessError::DeadlineExceeded {
                deadline: self.deadline,
                last_check: last_check.lock().unwrap().clone(),
            }),
        }
    }

    async fn run_sequence(
        &self,
        checks: Vec<ReadinessCheck>,
        last_check: Arc<Mutex<String>>,
    ) -> Result<(), ReadinessError> {
        for mut check in checks {
            last_check
                .lock()
                .unwrap()
                .clone_from(&check.name);
            info!(self.log, "check starting"; "check" => &check.name);
            let log = &self.log;
            let name = check.name.clone();
            let fatal = check.failure_is_fatal;
            let predicate = &mut check.predicate;
            let outcome = wait_for_condition(
                || {
                    let probe = predicate();
                    let name = name.clone();
                    async move {
                        match probe.await {
                            Ok(()) => Ok(()),
                            Err(e) if fatal => {
                                Err(CondCheckError::Failed(e))
                            }
                            Err(e) => {
                                debug!(
                                    log, "not ready yet";
                                    "check" => name,
                                    "error" => %e,
                                );
                                Err(CondCheckError::NotYet)
                            }
                        }
                    }
                },
                &check.policy,
            )
            .await;
            match outcome {
                Ok(()) => {
                    info!(self.log, "check passed"; "check" => &check.name);
                }
                Err(PollError::TimedOut(waited)) => {
                    return Err(ReadinessError::CheckTimedOut {
                        check: check.name,
                        waited,
                    });
                }
                Err(PollError::PermanentError(source)) => {
                    return Err(ReadinessError::CheckFailed {
                        check: check.name,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

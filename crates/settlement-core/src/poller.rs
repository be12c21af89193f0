//! Bounded settlement status polling.
//!
//! One tick = one oracle call. A tick awaits its call before the next sleep
//! is scheduled, so two checks for the same reference never overlap.
//!
//! While waiting for the next tick, expiry is polled ahead of a stop request:
//! an account that has already expired cannot be talked back into payment.
//! While a check is in flight the stop request goes first, then the oracle
//! reply, then expiry, so a success that lands together with expiry still
//! wins.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::oracle::SettlementOracle;
use crate::types::{FailureCause, OracleStatus, Reference, StatusReport, TokenMaterial};

/// How a single oracle reply is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckClass {
    /// Paid or Confirmed: stop polling.
    Settled,
    /// Pending or Processing: keep going.
    InProgress,
    /// Anything else, including transport errors: keep going, budget still spent.
    Inconclusive,
}

pub fn classify(status: &OracleStatus) -> CheckClass {
    if status.is_settled() {
        CheckClass::Settled
    } else if status.is_in_progress() {
        CheckClass::InProgress
    } else {
        CheckClass::Inconclusive
    }
}

/// What one tick observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickObservation {
    Status(OracleStatus),
    Error(String),
}

/// Progress notifications emitted while polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollProgress {
    CheckStarted {
        attempt: u32,
        max_attempts: u32,
    },
    CheckCompleted {
        attempt: u32,
        observation: TickObservation,
    },
}

/// Why polling stopped.
#[derive(Debug)]
pub enum PollVerdict<S> {
    Settled {
        status: OracleStatus,
        tokens: Option<TokenMaterial>,
    },
    Exhausted {
        cause: FailureCause,
    },
    Expired,
    /// The stop future resolved; carries its output.
    Interrupted(S),
    /// The progress callback asked to halt.
    Halted,
}

/// Drives status checks for one reference.
pub struct SettlementPoller {
    oracle: Arc<dyn SettlementOracle>,
    reference: Reference,
    interval: Duration,
    max_attempts: u32,
    check_timeout: Duration,
    check_immediately: bool,
    attempts_made: u32,
    transient_errors: u32,
}

impl SettlementPoller {
    pub fn new(
        oracle: Arc<dyn SettlementOracle>,
        reference: Reference,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            oracle,
            reference,
            interval: config.poll_interval(),
            max_attempts: config.max_attempts,
            check_timeout: config.check_timeout(),
            check_immediately: config.check_immediately,
            attempts_made: 0,
            transient_errors: 0,
        }
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn transient_errors(&self) -> u32 {
        self.transient_errors
    }

    /// Poll until settled, exhausted, expired, or stopped.
    ///
    /// `stop` and `expiry` are polled at every suspension point; whichever
    /// resolves first ends the run. `on_progress` runs synchronously on the
    /// polling task; returning `Break` ends the run before another oracle
    /// call is made.
    #[instrument(skip_all, fields(reference = %self.reference))]
    pub async fn run<S, E, F>(
        &mut self,
        stop: S,
        expiry: E,
        mut on_progress: F,
    ) -> PollVerdict<S::Output>
    where
        S: Future,
        E: Future<Output = ()>,
        F: FnMut(PollProgress) -> ControlFlow<()>,
    {
        tokio::pin!(stop);
        tokio::pin!(expiry);

        loop {
            if self.attempts_made >= self.max_attempts {
                let cause = if self.transient_errors >= self.attempts_made {
                    FailureCause::ChecksInconclusive
                } else {
                    FailureCause::NoSettlementObserved
                };
                info!(
                    attempts = self.attempts_made,
                    transient_errors = self.transient_errors,
                    cause = ?cause,
                    "Poll budget exhausted"
                );
                return PollVerdict::Exhausted { cause };
            }

            let delay = if self.attempts_made == 0 && self.check_immediately {
                Duration::ZERO
            } else {
                self.interval
            };

            tokio::select! {
                biased;
                _ = &mut expiry => {
                    debug!(attempts = self.attempts_made, "Expired before next tick");
                    return PollVerdict::Expired;
                }
                stopped = &mut stop => return PollVerdict::Interrupted(stopped),
                _ = sleep(delay) => {}
            }

            self.attempts_made += 1;
            let attempt = self.attempts_made;
            let started = on_progress(PollProgress::CheckStarted {
                attempt,
                max_attempts: self.max_attempts,
            });
            if started.is_break() {
                debug!(attempt, "Halted before status check");
                return PollVerdict::Halted;
            }

            let reply = tokio::select! {
                biased;
                stopped = &mut stop => return PollVerdict::Interrupted(stopped),
                reply = self.check() => reply,
                _ = &mut expiry => {
                    debug!(attempt, "Expired while check in flight");
                    return PollVerdict::Expired;
                }
            };

            let completed = match reply {
                Ok(report) => {
                    let class = classify(&report.status);
                    debug!(
                        attempt,
                        status = %report.status,
                        class = ?class,
                        "Status check completed"
                    );
                    let completed = on_progress(PollProgress::CheckCompleted {
                        attempt,
                        observation: TickObservation::Status(report.status.clone()),
                    });

                    if completed.is_continue() && class == CheckClass::Settled {
                        info!(attempt, status = %report.status, "Settlement observed");
                        return PollVerdict::Settled {
                            status: report.status,
                            tokens: report.tokens,
                        };
                    }
                    completed
                }
                Err(e) => {
                    self.transient_errors += 1;
                    warn!(attempt, error = %e, "Status check failed; counted against budget");
                    on_progress(PollProgress::CheckCompleted {
                        attempt,
                        observation: TickObservation::Error(e.to_string()),
                    })
                }
            };

            if completed.is_break() {
                debug!(attempt, "Halted after status check");
                return PollVerdict::Halted;
            }
        }
    }

    async fn check(&self) -> SettlementResult<StatusReport> {
        bounded_check(
            self.check_timeout,
            &self.reference,
            self.oracle.check_settlement_status(&self.reference),
        )
        .await
    }
}

/// Apply the per-call deadline to an oracle request.
pub(crate) async fn bounded_check<F>(
    limit: Duration,
    reference: &Reference,
    call: F,
) -> SettlementResult<StatusReport>
where
    F: Future<Output = SettlementResult<StatusReport>>,
{
    match timeout(limit, call).await {
        Ok(reply) => reply,
        Err(_) => Err(SettlementError::OracleTimeout {
            reference: reference.clone(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

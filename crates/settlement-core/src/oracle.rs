//! Settlement oracle seam.
//!
//! The oracle is whatever backend issues virtual accounts and knows whether a
//! transfer has settled. The engine only consumes its answers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{SettlementError, SettlementResult};
use crate::types::{OracleStatus, Reference, StatusReport, VirtualAccount, VirtualAccountRequest};

/// Backend collaborator that issues accounts and reports settlement status.
#[async_trait]
pub trait SettlementOracle: Send + Sync {
    /// Obtain the payable destination and its expiry.
    async fn create_or_fetch_virtual_account(
        &self,
        request: &VirtualAccountRequest,
    ) -> SettlementResult<VirtualAccount>;

    /// Per-tick status check.
    async fn check_settlement_status(&self, reference: &Reference)
        -> SettlementResult<StatusReport>;

    /// One-off verification after the user asserts they have paid.
    async fn confirm_manual_settlement(
        &self,
        reference: &Reference,
    ) -> SettlementResult<StatusReport>;
}

/// One scripted oracle reply.
#[derive(Clone, Debug)]
pub struct ScriptStep {
    pub delay: Duration,
    pub reply: Result<StatusReport, String>,
}

impl ScriptStep {
    pub fn report(report: StatusReport) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Ok(report),
        }
    }

    pub fn status(status: OracleStatus) -> Self {
        Self::report(StatusReport::with_status(status))
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Err(reason.into()),
        }
    }

    /// Delay the reply, simulating network latency.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// In-memory oracle replaying queued replies. Once a queue drains, every
/// further call answers `Pending`.
pub struct ScriptedOracle {
    bank_name: String,
    account_ttl: chrono::Duration,
    checks: Mutex<VecDeque<ScriptStep>>,
    manual: Mutex<VecDeque<ScriptStep>>,
    check_calls: AtomicU32,
    manual_calls: AtomicU32,
    issued: AtomicU32,
    refusal: Option<String>,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            bank_name: "Scripted Bank".to_string(),
            account_ttl: chrono::Duration::hours(24),
            checks: Mutex::new(VecDeque::new()),
            manual: Mutex::new(VecDeque::new()),
            check_calls: AtomicU32::new(0),
            manual_calls: AtomicU32::new(0),
            issued: AtomicU32::new(0),
            refusal: None,
        }
    }

    pub fn with_account_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.account_ttl = ttl;
        self
    }

    pub fn with_checks(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        lock(&self.checks).extend(steps);
        self
    }

    pub fn with_manual(self, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        lock(&self.manual).extend(steps);
        self
    }

    /// Queue a `Pending` reply `n` times.
    pub fn pending_for(self, n: usize) -> Self {
        self.with_checks((0..n).map(|_| ScriptStep::report(StatusReport::pending())))
    }

    /// Refuse every account request with `reason`.
    pub fn refusing_accounts(mut self, reason: impl Into<String>) -> Self {
        self.refusal = Some(reason.into());
        self
    }

    pub fn check_calls(&self) -> u32 {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn manual_calls(&self) -> u32 {
        self.manual_calls.load(Ordering::SeqCst)
    }

    async fn play(
        queue: &Mutex<VecDeque<ScriptStep>>,
        reference: &Reference,
    ) -> SettlementResult<StatusReport> {
        let step = lock(queue).pop_front();
        let step = step.unwrap_or_else(|| ScriptStep::report(StatusReport::pending()));

        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }

        step.reply
            .map_err(|reason| SettlementError::OracleUnavailable {
                reference: reference.clone(),
                reason,
            })
    }
}

#[async_trait]
impl SettlementOracle for ScriptedOracle {
    async fn create_or_fetch_virtual_account(
        &self,
        request: &VirtualAccountRequest,
    ) -> SettlementResult<VirtualAccount> {
        if let Some(reason) = &self.refusal {
            return Err(SettlementError::AccountUnavailable(reason.clone()));
        }

        let serial = self.issued.fetch_add(1, Ordering::SeqCst);
        let reference = Reference::generate();
        debug!(
            reference = %reference,
            amount_minor = request.amount_minor,
            currency = %request.currency,
            "Issuing scripted virtual account"
        );

        Ok(VirtualAccount::new(
            format!("99{:08}", 12_345_678u32.wrapping_add(serial) % 100_000_000),
            self.bank_name.clone(),
            reference,
            Some(Utc::now() + self.account_ttl),
        ))
    }

    async fn check_settlement_status(
        &self,
        reference: &Reference,
    ) -> SettlementResult<StatusReport> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        Self::play(&self.checks, reference).await
    }

    async fn confirm_manual_settlement(
        &self,
        reference: &Reference,
    ) -> SettlementResult<StatusReport> {
        self.manual_calls.fetch_add(1, Ordering::SeqCst);
        Self::play(&self.manual, reference).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Settlement confirmation orchestrator.
//!
//! Owns one settlement attempt end to end: the expiry tracker, the status
//! poller, the manual "I have paid" override, and the hand-off of token
//! material once confirmed.
//!
//! ```text
//! Idle ──start──▶ Polling ──▶ Confirmed | Failed | Expired | Cancelled
//! ```
//!
//! All right-hand states are terminal. The orchestrator only publishes state
//! and events; deciding how to present them (toasts, modal copy) is left to
//! the caller.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clipboard::Clipboard;
use crate::config::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::oracle::SettlementOracle;
use crate::poller::{
    bounded_check, classify, CheckClass, PollProgress, PollVerdict, SettlementPoller,
    TickObservation,
};
use crate::reveal::RevealController;
use crate::tracker::{Countdown, ExpirySignal, ExpiryTracker};
use crate::types::{
    AttemptSnapshot, AttemptStatus, CancelReason, ConfirmationPath, OracleStatus, Reference,
    SettlementOutcome, VirtualAccount, VirtualAccountRequest,
};

/// Events emitted over the lifetime of an attempt. Never carry token material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementEvent {
    /// Polling began.
    Started { reference: Reference },

    /// A status check is about to run.
    CheckStarted {
        reference: Reference,
        attempt: u32,
        max_attempts: u32,
    },

    /// A status check answered.
    CheckCompleted {
        reference: Reference,
        attempt: u32,
        observed: OracleStatus,
    },

    /// A status check failed in transport. Counted, not surfaced.
    CheckErrored {
        reference: Reference,
        attempt: u32,
        error: String,
    },

    /// The user asserted the transfer was made.
    ManualConfirmationRequested { reference: Reference },

    /// Status changed.
    Transition {
        reference: Reference,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    /// The attempt reached a terminal state.
    Finished {
        reference: Reference,
        status: AttemptStatus,
        message: &'static str,
    },
}

/// State shared between the orchestrator handle and its driver task.
struct Shared {
    reference: Reference,
    state_tx: watch::Sender<AttemptSnapshot>,
    events: broadcast::Sender<SettlementEvent>,
    outcome: Mutex<Option<SettlementOutcome>>,
    tracker: Mutex<Option<ExpiryTracker>>,
}

impl Shared {
    fn emit(&self, event: SettlementEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn status(&self) -> AttemptStatus {
        self.state_tx.borrow().status
    }

    fn begin_polling(&self) {
        let from = self.status();
        self.state_tx.send_modify(|s| s.status = AttemptStatus::Polling);
        self.emit(SettlementEvent::Started {
            reference: self.reference.clone(),
        });
        self.emit(SettlementEvent::Transition {
            reference: self.reference.clone(),
            from,
            to: AttemptStatus::Polling,
        });
    }

    /// Publish poll progress. Breaks once the attempt has finished so the
    /// poller makes no further oracle calls.
    fn on_progress(&self, progress: PollProgress) -> ControlFlow<()> {
        // Held for the whole update so nothing is published after finish()
        let outcome = lock(&self.outcome);
        if outcome.is_some() {
            return ControlFlow::Break(());
        }

        let countdown = lock(&self.tracker).as_ref().map(ExpiryTracker::current);

        match progress {
            PollProgress::CheckStarted {
                attempt,
                max_attempts,
            } => {
                self.state_tx.send_modify(|s| {
                    s.attempts_made = attempt;
                    if let Some(countdown) = countdown {
                        s.countdown = countdown;
                    }
                });
                self.emit(SettlementEvent::CheckStarted {
                    reference: self.reference.clone(),
                    attempt,
                    max_attempts,
                });
            }
            PollProgress::CheckCompleted {
                attempt,
                observation: TickObservation::Status(status),
            } => {
                self.state_tx
                    .send_modify(|s| s.last_observed = Some(status.clone()));
                self.emit(SettlementEvent::CheckCompleted {
                    reference: self.reference.clone(),
                    attempt,
                    observed: status,
                });
            }
            PollProgress::CheckCompleted {
                attempt,
                observation: TickObservation::Error(error),
            } => {
                self.state_tx.send_modify(|s| s.transient_errors += 1);
                self.emit(SettlementEvent::CheckErrored {
                    reference: self.reference.clone(),
                    attempt,
                    error,
                });
            }
        }

        ControlFlow::Continue(())
    }

    /// Record the terminal outcome. First caller wins; later calls are ignored.
    fn finish(&self, outcome: SettlementOutcome) -> bool {
        let mut slot = lock(&self.outcome);
        if slot.is_some() {
            return false;
        }

        let from = self.status();
        let to = outcome.status();
        if !from.can_transition_to(to) {
            warn!(
                reference = %self.reference,
                from = %from,
                to = %to,
                "Rejected non-monotonic transition"
            );
            return false;
        }

        // Timers stop with the attempt
        let tracker = lock(&self.tracker).take();
        let countdown = match (&outcome, tracker.as_ref()) {
            (SettlementOutcome::Expired, _) => Countdown::expired(),
            (_, Some(tracker)) => tracker.current(),
            (_, None) => self.state_tx.borrow().countdown.clone(),
        };
        drop(tracker);

        let message = outcome.message();
        *slot = Some(outcome);
        drop(slot);

        self.state_tx.send_modify(|s| {
            s.status = to;
            s.countdown = countdown;
        });

        info!(
            reference = %self.reference,
            from = %from,
            to = %to,
            "Settlement attempt finished"
        );

        self.emit(SettlementEvent::Transition {
            reference: self.reference.clone(),
            from,
            to,
        });
        self.emit(SettlementEvent::Finished {
            reference: self.reference.clone(),
            status: to,
            message,
        });
        true
    }
}

/// Engine for one settlement attempt.
///
/// Every handle method takes `&self`, so the orchestrator can be shared
/// behind an `Arc` by several UI callbacks. Dropping it aborts all of its
/// timers and tasks.
pub struct SettlementOrchestrator {
    account: VirtualAccount,
    config: SettlementConfig,
    oracle: Arc<dyn SettlementOracle>,
    clipboard: Arc<dyn Clipboard>,
    shared: Arc<Shared>,
    manual_tx: Mutex<Option<oneshot::Sender<()>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SettlementOrchestrator {
    /// Wrap an already-issued virtual account. Starts `Idle`.
    pub fn new(
        account: VirtualAccount,
        oracle: Arc<dyn SettlementOracle>,
        clipboard: Arc<dyn Clipboard>,
        config: SettlementConfig,
    ) -> SettlementResult<Self> {
        config.validate()?;

        let snapshot = AttemptSnapshot {
            reference: account.reference.clone(),
            status: AttemptStatus::Idle,
            attempts_made: 0,
            max_attempts: config.max_attempts,
            transient_errors: 0,
            countdown: Countdown::between(account.expires_at, Utc::now()),
            last_observed: None,
        };
        let (state_tx, _) = watch::channel(snapshot);
        let (events, _) = broadcast::channel(config.event_capacity);

        let shared = Arc::new(Shared {
            reference: account.reference.clone(),
            state_tx,
            events,
            outcome: Mutex::new(None),
            tracker: Mutex::new(None),
        });

        Ok(Self {
            account,
            config,
            oracle,
            clipboard,
            shared,
            manual_tx: Mutex::new(None),
            driver: Mutex::new(None),
        })
    }

    /// Obtain a virtual account from the oracle and wrap it.
    #[instrument(skip_all, fields(payer = %request.payer_reference))]
    pub async fn open(
        request: &VirtualAccountRequest,
        oracle: Arc<dyn SettlementOracle>,
        clipboard: Arc<dyn Clipboard>,
        config: SettlementConfig,
    ) -> SettlementResult<Self> {
        let account = oracle.create_or_fetch_virtual_account(request).await?;
        info!(
            reference = %account.reference,
            bank = %account.bank_name,
            expires_at = ?account.expires_at,
            "Virtual account issued"
        );
        Self::new(account, oracle, clipboard, config)
    }

    pub fn account(&self) -> &VirtualAccount {
        &self.account
    }

    pub fn reference(&self) -> &Reference {
        &self.account.reference
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Begin tracking expiry and polling. A no-op while already polling.
    #[instrument(skip(self), fields(reference = %self.account.reference))]
    pub fn start(&self) -> SettlementResult<()> {
        let mut driver = lock(&self.driver);

        match self.shared.status() {
            AttemptStatus::Idle => {}
            AttemptStatus::Polling => {
                debug!("Start ignored; already polling");
                return Ok(());
            }
            status => {
                return Err(SettlementError::AttemptFinished {
                    reference: self.account.reference.clone(),
                    status,
                })
            }
        }

        let tracker =
            ExpiryTracker::spawn(self.account.expires_at, self.config.tracker_refresh());
        let expiry = tracker.signal();
        self.shared
            .state_tx
            .send_modify(|s| s.countdown = tracker.current());
        *lock(&self.shared.tracker) = Some(tracker);

        let (manual_tx, manual_rx) = oneshot::channel();
        *lock(&self.manual_tx) = Some(manual_tx);

        self.shared.begin_polling();
        info!(
            max_attempts = self.config.max_attempts,
            poll_interval_ms = self.config.poll_interval_ms,
            "Settlement polling started"
        );

        let poller = SettlementPoller::new(
            self.oracle.clone(),
            self.account.reference.clone(),
            &self.config,
        );
        *driver = Some(tokio::spawn(drive(
            self.shared.clone(),
            self.oracle.clone(),
            self.config.clone(),
            poller,
            manual_rx,
            expiry,
        )));

        Ok(())
    }

    /// The user says they have paid. Stops polling and runs exactly one
    /// verification check; starts the attempt first if still idle.
    #[instrument(skip(self), fields(reference = %self.account.reference))]
    pub fn assert_paid(&self) -> SettlementResult<()> {
        let status = self.shared.status();
        if status.is_terminal() {
            return Err(SettlementError::AttemptFinished {
                reference: self.account.reference.clone(),
                status,
            });
        }
        if status == AttemptStatus::Idle {
            self.start()?;
        }

        let Some(manual_tx) = lock(&self.manual_tx).take() else {
            debug!("Manual confirmation already requested");
            return Ok(());
        };

        self.shared.emit(SettlementEvent::ManualConfirmationRequested {
            reference: self.account.reference.clone(),
        });

        manual_tx
            .send(())
            .map_err(|_| SettlementError::EngineStopped(self.account.reference.clone()))
    }

    /// The user closed the flow. Ends the attempt immediately and clears
    /// every timer. Closing a finished attempt does nothing.
    #[instrument(skip(self), fields(reference = %self.account.reference))]
    pub fn cancel(&self) {
        let finished = self.shared.finish(SettlementOutcome::Cancelled {
            reason: CancelReason::Closed,
        });
        self.teardown();
        if finished {
            debug!("Settlement attempt closed by user");
        }
    }

    /// Current state, with a fresh countdown.
    ///
    /// Without a running tracker (before start, or after any ending other
    /// than expiry) the countdown is derived from the account's expiry, so
    /// it still turns expired once the deadline passes.
    pub fn snapshot(&self) -> AttemptSnapshot {
        let mut snapshot = self.shared.state_tx.borrow().clone();
        if let Some(tracker) = lock(&self.shared.tracker).as_ref() {
            snapshot.countdown = tracker.current();
        } else if snapshot.status != AttemptStatus::Expired {
            snapshot.countdown = Countdown::between(self.account.expires_at, Utc::now());
        }
        snapshot
    }

    pub fn status(&self) -> AttemptStatus {
        self.shared.status()
    }

    /// Receiver that changes on status and attempt updates.
    pub fn watch(&self) -> watch::Receiver<AttemptSnapshot> {
        self.shared.state_tx.subscribe()
    }

    /// Live countdown, refreshed on the tracker cadence while polling.
    pub fn watch_countdown(&self) -> Option<watch::Receiver<Countdown>> {
        lock(&self.shared.tracker).as_ref().map(ExpiryTracker::watch)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.shared.events.subscribe()
    }

    /// Terminal outcome, if reached.
    pub fn outcome(&self) -> Option<SettlementOutcome> {
        lock(&self.shared.outcome).clone()
    }

    /// Wait for the attempt to reach a terminal state.
    pub async fn wait(&self) -> SettlementResult<SettlementOutcome> {
        let mut rx = self.shared.state_tx.subscribe();
        loop {
            if let Some(outcome) = self.outcome() {
                return Ok(outcome);
            }
            if rx.borrow_and_update().status == AttemptStatus::Idle {
                return Err(SettlementError::NotStarted(self.account.reference.clone()));
            }
            if rx.changed().await.is_err() {
                return Err(SettlementError::EngineStopped(self.account.reference.clone()));
            }
        }
    }

    /// Fresh, fully masked view over the confirmed tokens.
    ///
    /// Each call models reopening the reveal view, so every field starts
    /// masked again. `None` unless confirmed with tokens.
    pub fn reveal_session(&self) -> Option<RevealController> {
        let guard = lock(&self.shared.outcome);
        let tokens = guard.as_ref()?.tokens()?;
        Some(RevealController::for_tokens(
            tokens,
            self.clipboard.clone(),
            self.config.copy_ack(),
        ))
    }

    /// Masked view over the account number for the payment instructions.
    pub fn account_reveal(&self) -> RevealController {
        let mut controller = RevealController::new(self.clipboard.clone(), self.config.copy_ack());
        controller.register_account(&self.account);
        controller
    }

    fn teardown(&self) {
        if let Some(handle) = lock(&self.driver).take() {
            handle.abort();
        }
        lock(&self.shared.tracker).take();
        lock(&self.manual_tx).take();
    }
}

impl Drop for SettlementOrchestrator {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Driver task: poll, then settle the verdict into a terminal outcome.
async fn drive(
    shared: Arc<Shared>,
    oracle: Arc<dyn SettlementOracle>,
    config: SettlementConfig,
    mut poller: SettlementPoller,
    manual_rx: oneshot::Receiver<()>,
    expiry: ExpirySignal,
) {
    let progress = shared.clone();
    let verdict = poller
        .run(manual_rx, expiry.clone().fired(), move |p| progress.on_progress(p))
        .await;

    let outcome = match verdict {
        PollVerdict::Settled { tokens, .. } => SettlementOutcome::Confirmed {
            tokens,
            via: ConfirmationPath::Poll,
        },
        PollVerdict::Exhausted { cause } => SettlementOutcome::Failed { cause },
        PollVerdict::Expired => SettlementOutcome::Expired,
        // An expired account is no longer payable, whatever the user claims
        PollVerdict::Interrupted(Ok(())) if expiry.has_fired() => {
            info!(reference = %shared.reference, "Manual claim ignored; account expired");
            SettlementOutcome::Expired
        }
        PollVerdict::Interrupted(Ok(())) => {
            verify_manual(&shared, oracle.as_ref(), &config).await
        }
        // Handle dropped without asserting payment
        PollVerdict::Interrupted(Err(_)) => SettlementOutcome::Cancelled {
            reason: CancelReason::Closed,
        },
        // Already finished elsewhere
        PollVerdict::Halted => return,
    };

    shared.finish(outcome);
}

/// The single out-of-band check behind "I have paid".
async fn verify_manual(
    shared: &Shared,
    oracle: &dyn SettlementOracle,
    config: &SettlementConfig,
) -> SettlementOutcome {
    let reference = &shared.reference;
    info!(reference = %reference, "Verifying manual settlement claim");

    match bounded_check(
        config.check_timeout(),
        reference,
        oracle.confirm_manual_settlement(reference),
    )
    .await
    {
        Ok(report) if classify(&report.status) == CheckClass::Settled => {
            info!(reference = %reference, status = %report.status, "Manual claim verified");
            SettlementOutcome::Confirmed {
                tokens: report.tokens,
                via: ConfirmationPath::ManualOverride,
            }
        }
        Ok(report) => {
            info!(
                reference = %reference,
                status = %report.status,
                "Manual claim not yet verifiable"
            );
            shared
                .state_tx
                .send_modify(|s| s.last_observed = Some(report.status.clone()));
            SettlementOutcome::Cancelled {
                reason: CancelReason::ManualVerificationFailed,
            }
        }
        Err(e) => {
            warn!(reference = %reference, error = %e, "Manual verification check failed");
            SettlementOutcome::Cancelled {
                reason: CancelReason::ManualVerificationFailed,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::oracle::{ScriptStep, ScriptedOracle};
    use std::time::Duration;

    fn account(ttl: chrono::Duration) -> VirtualAccount {
        VirtualAccount::new(
            "9912345678",
            "Providus",
            Reference::new("ref-orch"),
            Some(Utc::now() + ttl),
        )
    }

    fn orchestrator(
        oracle: Arc<ScriptedOracle>,
        config: SettlementConfig,
    ) -> SettlementOrchestrator {
        SettlementOrchestrator::new(
            account(chrono::Duration::hours(24)),
            oracle,
            Arc::new(MemoryClipboard::new()),
            config,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_polling() {
        let oracle = Arc::new(ScriptedOracle::new());
        let orch = orchestrator(oracle.clone(), SettlementConfig::default());
        assert_eq!(orch.status(), AttemptStatus::Idle);

        orch.start().unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        orch.start().unwrap();

        let snapshot = orch.snapshot();
        assert_eq!(snapshot.status, AttemptStatus::Polling);
        assert_eq!(snapshot.attempts_made, 1);
        assert_eq!(oracle.check_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_terminal_is_rejected() {
        let orch = orchestrator(Arc::new(ScriptedOracle::new()), SettlementConfig::default());
        orch.cancel();

        let err = orch.start().unwrap_err();
        assert!(matches!(
            err,
            SettlementError::AttemptFinished {
                status: AttemptStatus::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_before_start_is_an_error() {
        let orch = orchestrator(Arc::new(ScriptedOracle::new()), SettlementConfig::default());
        assert!(matches!(orch.wait().await, Err(SettlementError::NotStarted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_verified_ends_confirmed() {
        let oracle = Arc::new(
            ScriptedOracle::new().with_manual([ScriptStep::status(OracleStatus::Paid)]),
        );
        let orch = orchestrator(oracle.clone(), SettlementConfig::default());

        orch.start().unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        orch.assert_paid().unwrap();
        orch.assert_paid().unwrap();

        let outcome = orch.wait().await.unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Confirmed {
                via: ConfirmationPath::ManualOverride,
                ..
            }
        ));
        assert_eq!(oracle.manual_calls(), 1);
        assert_eq!(oracle.check_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_override_unverified_is_cancelled_not_failed() {
        let oracle = Arc::new(ScriptedOracle::new());
        let orch = orchestrator(oracle.clone(), SettlementConfig::default());

        orch.assert_paid().unwrap();
        let outcome = orch.wait().await.unwrap();

        assert!(matches!(
            outcome,
            SettlementOutcome::Cancelled {
                reason: CancelReason::ManualVerificationFailed
            }
        ));
        assert_eq!(oracle.manual_calls(), 1);
        assert_eq!(oracle.check_calls(), 0);
        assert!(orch.reveal_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_claim_on_expired_account_ends_expired() {
        let oracle = Arc::new(
            ScriptedOracle::new().with_manual([ScriptStep::status(OracleStatus::Paid)]),
        );
        let orch = SettlementOrchestrator::new(
            account(-chrono::Duration::minutes(1)),
            oracle.clone(),
            Arc::new(MemoryClipboard::new()),
            SettlementConfig::default(),
        )
        .unwrap();

        orch.assert_paid().unwrap();
        let outcome = orch.wait().await.unwrap();

        assert!(matches!(outcome, SettlementOutcome::Expired));
        assert_eq!(oracle.manual_calls(), 0);
        assert_eq!(oracle.check_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_after_finish_halts_polling() {
        let orch = orchestrator(Arc::new(ScriptedOracle::new()), SettlementConfig::default());
        orch.start().unwrap();
        orch.cancel();

        let flow = orch.shared.on_progress(PollProgress::CheckStarted {
            attempt: 1,
            max_attempts: 12,
        });

        assert!(flow.is_break());
        assert_eq!(orch.snapshot().attempts_made, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_keeps_running_after_confirmation() {
        let oracle = Arc::new(
            ScriptedOracle::new().with_checks([ScriptStep::status(OracleStatus::Confirmed)]),
        );
        let config = SettlementConfig {
            check_immediately: true,
            ..Default::default()
        };
        let orch = SettlementOrchestrator::new(
            account(chrono::Duration::milliseconds(300)),
            oracle,
            Arc::new(MemoryClipboard::new()),
            config,
        )
        .unwrap();

        orch.start().unwrap();
        orch.wait().await.unwrap();
        assert_eq!(orch.status(), AttemptStatus::Confirmed);
        assert!(!orch.snapshot().countdown.is_expired);

        // The expiry is wall-clock; the paused runtime clock does not move it
        std::thread::sleep(Duration::from_millis(400));
        let countdown = orch.snapshot().countdown;
        assert!(countdown.is_expired);
        assert_eq!(countdown.remaining_label, crate::tracker::EXPIRED_LABEL);
    }

    #[tokio::test(start_paused = true)]
    async fn events_follow_lifecycle_without_tokens() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .with_checks([ScriptStep::error("gateway timeout")])
                .with_checks([ScriptStep::status(OracleStatus::Confirmed)]),
        );
        let orch = orchestrator(oracle, SettlementConfig::default());
        let mut events = orch.subscribe();

        orch.start().unwrap();
        orch.wait().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }

        assert!(matches!(seen.first(), Some(SettlementEvent::Started { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, SettlementEvent::CheckErrored { attempt: 1, .. })));
        assert!(matches!(
            seen.last(),
            Some(SettlementEvent::Finished {
                status: AttemptStatus::Confirmed,
                ..
            })
        ));
        assert_eq!(orch.snapshot().transient_errors, 1);
    }
}

//! # Settlement Core - Payment Settlement Confirmation Engine
//!
//! Drives one payment attempt from "account issued" to a terminal outcome:
//! the payer transfers funds to a time-limited virtual account, the engine
//! polls a settlement oracle on a fixed cadence with a bounded budget, and
//! once settlement is confirmed it hands back sensitive token material
//! behind a mask/reveal/copy controller.
//!
//! ## Key Components
//!
//! - [`ExpiryTracker`]: live countdown to the account's expiry
//! - [`SettlementPoller`]: bounded, non-overlapping status checks
//! - [`RevealController`]: per-field mask, reveal and copy for secrets
//! - [`SettlementOrchestrator`]: the attempt state machine tying them together
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use settlement_core::{
//!     MemoryClipboard, ScriptedOracle, SettlementConfig, SettlementOrchestrator,
//!     VirtualAccountRequest,
//! };
//!
//! # async fn example() -> settlement_core::SettlementResult<()> {
//! let request = VirtualAccountRequest {
//!     amount_minor: 250_000,
//!     currency: "NGN".into(),
//!     payer_reference: "meter-4512".into(),
//!     description: None,
//! };
//!
//! let orchestrator = SettlementOrchestrator::open(
//!     &request,
//!     Arc::new(ScriptedOracle::new()),
//!     Arc::new(MemoryClipboard::new()),
//!     SettlementConfig::default(),
//! )
//! .await?;
//!
//! orchestrator.start()?;
//! let outcome = orchestrator.wait().await?;
//! println!("{}", outcome.message());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod clipboard;
pub mod config;
pub mod error;
pub mod oracle;
pub mod orchestrator;
pub mod poller;
pub mod reveal;
pub mod tracker;
pub mod types;

pub use clipboard::{Clipboard, MemoryClipboard};
pub use config::{FlowKind, SettlementConfig};
pub use error::{SettlementError, SettlementResult};
pub use oracle::{ScriptStep, ScriptedOracle, SettlementOracle};
pub use orchestrator::{SettlementEvent, SettlementOrchestrator};
pub use poller::{
    classify, CheckClass, PollProgress, PollVerdict, SettlementPoller, TickObservation,
};
pub use reveal::{FieldKey, MaskPolicy, RevealController, RevealState};
pub use tracker::{format_remaining, Countdown, ExpirySignal, ExpiryTracker, EXPIRED_LABEL};
pub use types::{
    AttemptSnapshot, AttemptStatus, CancelReason, ConfirmationPath, FailureCause, OracleStatus,
    Reference, SecretString, SettlementOutcome, StatusReport, TokenMaterial, VendToken,
    VirtualAccount, VirtualAccountRequest,
};

//! Core data model for settlement confirmation.
//!
//! Wire shapes received from the settlement oracle ([`VirtualAccount`],
//! [`StatusReport`]) sit next to the client-side lifecycle types
//! ([`AttemptStatus`], [`SettlementOutcome`], [`AttemptSnapshot`]).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::tracker::Countdown;

/// Correlation id for one settlement attempt.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference(pub String);

impl Reference {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh reference for a new attempt.
    pub fn generate() -> Self {
        Self(format!("stl-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request to open (or re-open) a payable destination.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualAccountRequest {
    /// Amount due in minor units.
    pub amount_minor: u64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Customer-side identifier the payment is for (meter number, invoice id).
    pub payer_reference: String,
    /// Free-form narration shown on the transfer.
    #[serde(default)]
    pub description: Option<String>,
}

/// A time-limited payment destination issued for one settlement attempt.
///
/// Immutable once issued. A missing or malformed expiry is kept as `None`
/// and treated as already expired.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub account_number: String,
    pub bank_name: String,
    pub reference: Reference,
    #[serde(default, deserialize_with = "lenient_expiry")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl VirtualAccount {
    pub fn new(
        account_number: impl Into<String>,
        bank_name: impl Into<String>,
        reference: Reference,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            account_number: account_number.into(),
            bank_name: bank_name.into(),
            reference,
            expires_at,
        }
    }

    /// Whether funds may still be sent to this account at `now`.
    pub fn is_payable_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now < expires_at)
    }
}

/// Parse an ISO-8601 / RFC 3339 expiry. Anything unparseable yields `None`.
pub fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn lenient_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(|v| v.as_str()).and_then(parse_expiry))
}

/// A sensitive string that is wiped on drop and never printed by `Debug`.
///
/// Implements `Deserialize` but not `Serialize`: values can arrive from the
/// oracle but cannot be written back out.
#[derive(Clone, Default)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the raw value. Callers must not log it.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for SecretString {}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([redacted])")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// One vend or key-change token issued to a prepaid meter.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct VendToken {
    pub token_hex: SecretString,
    pub token_dec: SecretString,
    pub tid: String,
    pub drn: String,
    pub krn: String,
    pub sgc: String,
    pub ti: String,
    #[serde(default)]
    pub transfer_amount: Option<String>,
    #[serde(default)]
    pub pan: Option<SecretString>,
    #[serde(default)]
    pub description: String,
}

/// The full token set revealed on confirmation.
///
/// Lives only in memory for as long as the owning view. Not serializable.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct TokenMaterial {
    tokens: Vec<VendToken>,
}

impl TokenMaterial {
    pub fn new(tokens: Vec<VendToken>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[VendToken] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl fmt::Debug for TokenMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenMaterial")
            .field("count", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

/// Status string reported by the settlement oracle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OracleStatus {
    Pending,
    Processing,
    Paid,
    Confirmed,
    Failed,
    /// Any status the client does not know about.
    Unrecognized(String),
}

impl OracleStatus {
    /// Funds were received and matched.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Paid | Self::Confirmed)
    }

    /// Settlement is still in progress on the oracle side.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

impl From<String> for OracleStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "paid" => Self::Paid,
            "confirmed" => Self::Confirmed,
            "failed" => Self::Failed,
            _ => Self::Unrecognized(raw),
        }
    }
}

impl From<OracleStatus> for String {
    fn from(status: OracleStatus) -> Self {
        status.to_string()
    }
}

impl fmt::Display for OracleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Processing => write!(f, "Processing"),
            Self::Paid => write!(f, "Paid"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Failed => write!(f, "Failed"),
            Self::Unrecognized(raw) => write!(f, "{}", raw),
        }
    }
}

/// One oracle response: the status plus tokens when settlement issued any.
#[derive(Clone, Debug, Deserialize)]
pub struct StatusReport {
    pub status: OracleStatus,
    #[serde(default)]
    pub tokens: Option<TokenMaterial>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self {
            status: OracleStatus::Pending,
            tokens: None,
        }
    }

    pub fn confirmed(tokens: Option<TokenMaterial>) -> Self {
        Self {
            status: OracleStatus::Confirmed,
            tokens,
        }
    }

    pub fn with_status(status: OracleStatus) -> Self {
        Self {
            status,
            tokens: None,
        }
    }
}

/// Lifecycle status of a settlement attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    Idle,
    Polling,
    Confirmed,
    Failed,
    Expired,
    Cancelled,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Confirmed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Transitions are monotonic: terminal states never move again.
    pub fn can_transition_to(self, next: AttemptStatus) -> bool {
        match self {
            Self::Idle => next != Self::Idle,
            Self::Polling => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Polling => write!(f, "polling"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a confirmation was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationPath {
    Poll,
    ManualOverride,
}

/// Why an attempt ended in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The oracle answered but never reported settlement.
    NoSettlementObserved,
    /// Every check in the budget errored, so nothing was learned.
    ChecksInconclusive,
}

/// Why an attempt ended in `Cancelled`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The hosting view was closed.
    Closed,
    /// The user asserted payment and the verification check did not confirm it.
    ManualVerificationFailed,
}

/// Terminal result handed back to the caller.
#[derive(Clone, Debug)]
pub enum SettlementOutcome {
    Confirmed {
        tokens: Option<TokenMaterial>,
        via: ConfirmationPath,
    },
    Failed {
        cause: FailureCause,
    },
    Expired,
    Cancelled {
        reason: CancelReason,
    },
}

impl SettlementOutcome {
    pub fn status(&self) -> AttemptStatus {
        match self {
            Self::Confirmed { .. } => AttemptStatus::Confirmed,
            Self::Failed { .. } => AttemptStatus::Failed,
            Self::Expired => AttemptStatus::Expired,
            Self::Cancelled { .. } => AttemptStatus::Cancelled,
        }
    }

    pub fn tokens(&self) -> Option<&TokenMaterial> {
        match self {
            Self::Confirmed { tokens, .. } => tokens.as_ref(),
            _ => None,
        }
    }

    /// User-facing copy for the terminal state.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Confirmed { .. } => "Payment confirmed.",
            Self::Failed {
                cause: FailureCause::NoSettlementObserved,
            } => "We could not confirm your payment in time. Please contact support or try again.",
            Self::Failed {
                cause: FailureCause::ChecksInconclusive,
            } => {
                "We could not reach the payment service to confirm your transfer. \
                 Please contact support or try again."
            }
            Self::Expired => {
                "The payment window has closed. Start a new payment to get a fresh account."
            }
            Self::Cancelled {
                reason: CancelReason::Closed,
            } => "Payment confirmation was closed.",
            Self::Cancelled {
                reason: CancelReason::ManualVerificationFailed,
            } => {
                "We could not verify your payment yet. \
                 If you have paid, it will be applied once the bank settles."
            }
        }
    }
}

/// Live view of an attempt for the presentation layer.
#[derive(Clone, Debug)]
pub struct AttemptSnapshot {
    pub reference: Reference,
    pub status: AttemptStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub transient_errors: u32,
    pub countdown: Countdown,
    pub last_observed: Option<OracleStatus>,
}

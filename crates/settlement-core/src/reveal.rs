//! Masked display and explicit reveal of sensitive fields.
//!
//! Every field starts masked. Revealing is per field and per user action.
//! There is no bulk reveal. Copy always writes the raw value and
//! never touches mask state. Raw values are never logged, only field keys and
//! lengths.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clipboard::Clipboard;
use crate::error::{SettlementError, SettlementResult};
use crate::types::{SecretString, TokenMaterial, VirtualAccount};

/// Filler placed between the visible edges of a partially masked value.
pub const MASK_FILL: &str = "••••";

/// Rendering of a fully masked value. Fixed width regardless of input.
pub const FULL_MASK: &str = "••••••••";

/// Edges are only shown when at least this many characters stay hidden.
const MIN_HIDDEN: usize = 4;

/// How a masked value is rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Show the first `head` and last `tail` characters.
    Edges { head: usize, tail: usize },
    /// Show nothing.
    Full,
}

impl MaskPolicy {
    /// Account-like identifiers: first 6, last 4.
    pub const ACCOUNT: Self = Self::Edges { head: 6, tail: 4 };
    /// Tokens and keys.
    pub const SECRET: Self = Self::Full;

    /// Masked rendering of `value`. Never equal to `value` itself, even when
    /// the raw value is made of mask characters.
    pub fn mask(&self, value: &str) -> String {
        let rendered = match *self {
            Self::Full => FULL_MASK.to_string(),
            Self::Edges { head, tail } => {
                let chars: Vec<char> = value.chars().collect();
                if chars.len() < head + tail + MIN_HIDDEN {
                    FULL_MASK.to_string()
                } else {
                    let shown_head: String = chars[..head].iter().collect();
                    let shown_tail: String = chars[chars.len() - tail..].iter().collect();
                    format!("{}{}{}", shown_head, MASK_FILL, shown_tail)
                }
            }
        };

        if rendered != value {
            rendered
        } else if value == FULL_MASK {
            format!("{}{}", FULL_MASK, MASK_FILL)
        } else {
            FULL_MASK.to_string()
        }
    }
}

/// Stable key naming one sensitive field in a view.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey(pub String);

impl FieldKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn token_hex(index: usize) -> Self {
        Self(format!("token.{}.hex", index))
    }

    pub fn token_dec(index: usize) -> Self {
        Self(format!("token.{}.dec", index))
    }

    pub fn token_pan(index: usize) -> Self {
        Self(format!("token.{}.pan", index))
    }

    pub fn account_number() -> Self {
        Self("account.number".to_string())
    }
}

impl From<&str> for FieldKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Render state for one field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevealState {
    pub key: FieldKey,
    /// What the view should display: masked or raw.
    pub value: String,
    pub is_masked: bool,
    pub copied: bool,
}

struct RevealField {
    value: SecretString,
    policy: MaskPolicy,
    is_masked: bool,
}

/// Per-view controller for sensitive fields.
pub struct RevealController {
    fields: BTreeMap<FieldKey, RevealField>,
    clipboard: Arc<dyn Clipboard>,
    ack_ttl: Duration,
    acks: HashMap<FieldKey, Instant>,
}

impl RevealController {
    pub fn new(clipboard: Arc<dyn Clipboard>, ack_ttl: Duration) -> Self {
        Self {
            fields: BTreeMap::new(),
            clipboard,
            ack_ttl,
            acks: HashMap::new(),
        }
    }

    /// Controller over every secret in a confirmed token set.
    pub fn for_tokens(
        tokens: &TokenMaterial,
        clipboard: Arc<dyn Clipboard>,
        ack_ttl: Duration,
    ) -> Self {
        let mut controller = Self::new(clipboard, ack_ttl);
        controller.register_tokens(tokens);
        controller
    }

    pub fn register_tokens(&mut self, tokens: &TokenMaterial) {
        for (index, token) in tokens.tokens().iter().enumerate() {
            self.register(
                FieldKey::token_hex(index),
                token.token_hex.clone(),
                MaskPolicy::SECRET,
            );
            self.register(
                FieldKey::token_dec(index),
                token.token_dec.clone(),
                MaskPolicy::SECRET,
            );
            if let Some(pan) = &token.pan {
                self.register(FieldKey::token_pan(index), pan.clone(), MaskPolicy::ACCOUNT);
            }
        }
    }

    pub fn register_account(&mut self, account: &VirtualAccount) {
        self.register(
            FieldKey::account_number(),
            account.account_number.as_str(),
            MaskPolicy::ACCOUNT,
        );
    }

    /// Add a field. It starts masked; re-registering a key re-masks it.
    pub fn register(
        &mut self,
        key: impl Into<FieldKey>,
        value: impl Into<SecretString>,
        policy: MaskPolicy,
    ) {
        let key = key.into();
        self.acks.remove(&key);
        self.fields.insert(
            key,
            RevealField {
                value: value.into(),
                policy,
                is_masked: true,
            },
        );
    }

    /// Flip one field between masked and revealed. Returns the new mask flag.
    pub fn toggle_reveal(&mut self, key: &FieldKey) -> SettlementResult<bool> {
        let field = self
            .fields
            .get_mut(key)
            .ok_or_else(|| SettlementError::UnknownField(key.to_string()))?;
        field.is_masked = !field.is_masked;
        debug!(field = %key, masked = field.is_masked, "Toggled secret visibility");
        Ok(field.is_masked)
    }

    pub fn is_masked(&self, key: &FieldKey) -> SettlementResult<bool> {
        self.field(key).map(|f| f.is_masked)
    }

    /// Masked rendering while masked, the raw value once revealed.
    pub fn view(&self, key: &FieldKey) -> SettlementResult<String> {
        let field = self.field(key)?;
        Ok(if field.is_masked {
            field.policy.mask(field.value.expose())
        } else {
            field.value.expose().to_string()
        })
    }

    /// Write the raw value to the clipboard, whatever the mask state.
    pub fn copy_to_clipboard(&mut self, key: &FieldKey) -> SettlementResult<()> {
        let field = self.field(key)?;
        let chars = field.value.char_len();

        if let Err(e) = self.clipboard.write_text(field.value.expose()) {
            warn!(field = %key, error = %e, "Clipboard write failed");
            return Err(e);
        }

        debug!(field = %key, chars, "Copied secret to clipboard");
        self.acks.insert(key.clone(), Instant::now() + self.ack_ttl);
        Ok(())
    }

    /// Whether the transient "copied" acknowledgement is still showing.
    pub fn is_copied(&self, key: &FieldKey) -> bool {
        self.acks
            .get(key)
            .map(|until| Instant::now() < *until)
            .unwrap_or(false)
    }

    /// Reset for a reopened view: every field masked, acknowledgements cleared.
    pub fn reopen(&mut self) {
        for field in self.fields.values_mut() {
            field.is_masked = true;
        }
        self.acks.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &FieldKey> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Render state for every field, in key order.
    pub fn states(&self) -> Vec<RevealState> {
        self.fields
            .iter()
            .map(|(key, field)| RevealState {
                key: key.clone(),
                value: if field.is_masked {
                    field.policy.mask(field.value.expose())
                } else {
                    field.value.expose().to_string()
                },
                is_masked: field.is_masked,
                copied: self.is_copied(key),
            })
            .collect()
    }

    fn field(&self, key: &FieldKey) -> SettlementResult<&RevealField> {
        self.fields
            .get(key)
            .ok_or_else(|| SettlementError::UnknownField(key.to_string()))
    }
}

impl fmt::Debug for RevealController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.iter().map(|(k, v)| (k, v.is_masked)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::types::VendToken;
    use proptest::prelude::*;

    fn token(hex: &str, dec: &str) -> VendToken {
        VendToken {
            token_hex: hex.into(),
            token_dec: dec.into(),
            tid: "5678".into(),
            drn: "04040404040".into(),
            krn: "1".into(),
            sgc: "600727".into(),
            ti: "07".into(),
            transfer_amount: Some("25.0".into()),
            pan: None,
            description: "Credit".into(),
        }
    }

    fn controller() -> (RevealController, Arc<MemoryClipboard>) {
        let clipboard = Arc::new(MemoryClipboard::new());
        let controller = RevealController::new(clipboard.clone(), Duration::from_millis(2_000));
        (controller, clipboard)
    }

    #[test]
    fn account_policy_shows_edges() {
        assert_eq!(MaskPolicy::ACCOUNT.mask("1234567890123456"), "123456••••3456");
        assert_eq!(MaskPolicy::ACCOUNT.mask("12345"), FULL_MASK);
        assert_eq!(MaskPolicy::SECRET.mask("anything at all"), FULL_MASK);
    }

    #[test]
    fn fields_start_masked_and_toggle_individually() {
        let (mut reveal, _) = controller();
        let tokens = TokenMaterial::new(vec![
            token("0A1B2C3D4E5F", "11112222333344445555"),
            token("FFEEDDCCBBAA", "99998888777766665555"),
        ]);
        reveal.register_tokens(&tokens);
        assert_eq!(reveal.len(), 4);
        assert!(reveal.states().iter().all(|s| s.is_masked));

        let first = FieldKey::token_dec(0);
        assert!(!reveal.toggle_reveal(&first).unwrap());
        assert_eq!(reveal.view(&first).unwrap(), "11112222333344445555");
        assert!(reveal.is_masked(&FieldKey::token_dec(1)).unwrap());
        assert_eq!(reveal.view(&FieldKey::token_hex(0)).unwrap(), FULL_MASK);
    }

    #[test]
    fn reopen_remasks_everything() {
        let (mut reveal, _) = controller();
        reveal.register("secret.key", "sk_live_abcdef", MaskPolicy::SECRET);
        let key = FieldKey::from("secret.key");

        reveal.toggle_reveal(&key).unwrap();
        reveal.copy_to_clipboard(&key).unwrap();
        reveal.reopen();

        assert!(reveal.is_masked(&key).unwrap());
        assert!(!reveal.is_copied(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn copy_writes_raw_and_acknowledgement_expires() {
        let (mut reveal, clipboard) = controller();
        reveal.register("account.number", "9912345678", MaskPolicy::ACCOUNT);
        let key = FieldKey::account_number();

        reveal.copy_to_clipboard(&key).unwrap();
        assert_eq!(clipboard.contents().unwrap().expose(), "9912345678");
        assert!(reveal.is_masked(&key).unwrap());
        assert!(reveal.is_copied(&key));

        tokio::time::sleep(Duration::from_millis(2_001)).await;
        assert!(!reveal.is_copied(&key));
        assert_eq!(clipboard.writes(), 1);
    }

    #[test]
    fn values_made_of_mask_characters_still_render_masked() {
        assert_ne!(MaskPolicy::SECRET.mask(FULL_MASK), FULL_MASK);
        assert_ne!(MaskPolicy::ACCOUNT.mask(FULL_MASK), FULL_MASK);
        assert_eq!(MaskPolicy::ACCOUNT.mask("123456••••3456"), FULL_MASK);
    }

    #[test]
    fn failed_copy_leaves_no_acknowledgement() {
        let clipboard = Arc::new(MemoryClipboard::unavailable("permission denied"));
        let mut reveal = RevealController::new(clipboard.clone(), Duration::from_millis(2_000));
        reveal.register("account.number", "9912345678", MaskPolicy::ACCOUNT);
        let key = FieldKey::account_number();

        let err = reveal.copy_to_clipboard(&key).unwrap_err();
        assert!(matches!(err, SettlementError::Clipboard(_)));
        assert!(!reveal.is_copied(&key));
        assert!(clipboard.contents().is_none());
        assert_eq!(clipboard.writes(), 0);
    }

    #[test]
    fn unknown_field_is_an_error() {
        let (mut reveal, _) = controller();
        let err = reveal.toggle_reveal(&FieldKey::from("nope")).unwrap_err();
        assert!(matches!(err, SettlementError::UnknownField(_)));
    }

    proptest! {
        #[test]
        fn masked_view_never_returns_raw(value in "[0-9A-Za-z•]{1,64}", full in any::<bool>()) {
            let (mut reveal, clipboard) = controller();
            let policy = if full { MaskPolicy::SECRET } else { MaskPolicy::ACCOUNT };
            reveal.register("field", value.as_str(), policy);
            let key = FieldKey::from("field");

            prop_assert_ne!(reveal.view(&key).unwrap(), value.clone());

            reveal.copy_to_clipboard(&key).unwrap();
            let copied = clipboard.contents().unwrap();
            prop_assert_eq!(copied.expose(), value.as_str());
            prop_assert!(reveal.is_masked(&key).unwrap());
        }
    }
}

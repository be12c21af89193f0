//! Clipboard seam used by the reveal controller.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{SettlementError, SettlementResult};
use crate::types::SecretString;

/// Destination for copy-to-clipboard.
pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> SettlementResult<()>;
}

/// Clipboard that keeps the last write in memory.
#[derive(Default)]
pub struct MemoryClipboard {
    contents: Mutex<Option<SecretString>>,
    writes: AtomicU32,
    denied: Option<String>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clipboard the host refuses to write to, e.g. permission denied.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            denied: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn contents(&self) -> Option<SecretString> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Clipboard for MemoryClipboard {
    fn write_text(&self, text: &str) -> SettlementResult<()> {
        if let Some(reason) = &self.denied {
            return Err(SettlementError::Clipboard(reason.clone()));
        }

        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(SecretString::new(text));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

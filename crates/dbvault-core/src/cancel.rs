use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, VaultError};

/// Cooperative cancellation flag cloned into every blocking call of a run.
///
/// A token may be linked to a process-wide flag (the CLI's signal handler);
/// it then reports cancelled when either flag is set.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<&'static AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(parent: &'static AtomicBool) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(parent),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.parent.is_some_and(|p| p.load(Ordering::SeqCst))
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}

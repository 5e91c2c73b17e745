//! Cancellation support for stream jobs
//!
//! The reason travels with the signal, so whoever observes the cancellation
//! can tell a user stop from a stream superseded by a newer one.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Why a stream job was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// User pressed stop
    UserCancelled,
    /// A new stream replaced this one
    SupersededByNewStream,
}

impl CancellationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationReason::UserCancelled => "user_cancelled",
            CancellationReason::SupersededByNewStream => "superseded_by_new_stream",
        }
    }
}

/// CancellationToken that remembers the first reason it was cancelled with
#[derive(Debug, Clone, Default)]
pub struct StreamCancellation {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancellationReason>>>,
}

impl StreamCancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with `reason`. Returns false if already cancelled; the first
    /// reason is kept.
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.token.cancel();
        true
    }

    pub fn reason(&self) -> Option<CancellationReason> {
        *self.reason.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Get a child token for a subtask
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

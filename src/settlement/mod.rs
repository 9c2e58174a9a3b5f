//! Settlement observation
//!
//! A submitted operation is only known to be final once its status source
//! reports one of the terminal statuses. The poller waits for that with a
//! bounded timeout and can be interrupted.

pub mod chain;
pub mod poller;

pub use chain::ChainSettlement;
pub use poller::SettlementPoller;

use crate::error::CoordinatorResult;
use crate::task::{OperationHandle, OperationStatus};

use async_trait::async_trait;

/// Terminal outcome of an external operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Complete,
    Failed,
    Cancelled,
}

impl Settlement {
    /// Classify a raw status; anything outside the terminal set is still pending
    pub fn classify(status: &str) -> Option<Self> {
        match status {
            "COMPLETE" => Some(Settlement::Complete),
            "FAILED" => Some(Settlement::Failed),
            "CANCELLED" => Some(Settlement::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::Complete => "COMPLETE",
            Settlement::Failed => "FAILED",
            Settlement::Cancelled => "CANCELLED",
        }
    }
}

impl From<Settlement> for OperationStatus {
    fn from(s: Settlement) -> Self {
        match s {
            Settlement::Complete => OperationStatus::Complete,
            Settlement::Failed => OperationStatus::Failed,
            Settlement::Cancelled => OperationStatus::Cancelled,
        }
    }
}

/// Where operation statuses are read from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettlementSource: Send + Sync {
    /// Current raw status string of the operation
    async fn query_status(&self, handle: &OperationHandle) -> CoordinatorResult<String>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable status source for orchestration tests

    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Status per handle, `COMPLETE` unless set otherwise
    #[derive(Default)]
    pub struct StatusBoard {
        pub statuses: DashMap<String, String>,
        default_status: Mutex<Option<String>>,
        queries: AtomicUsize,
    }

    impl StatusBoard {
        pub fn set_default(&self, status: &str) {
            *self.default_status.lock().unwrap() = Some(status.to_string());
        }

        pub fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SettlementSource for StatusBoard {
        async fn query_status(&self, handle: &OperationHandle) -> CoordinatorResult<String> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.statuses.get(handle.as_str()) {
                return Ok(status.clone());
            }
            Ok(self
                .default_status
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "COMPLETE".to_string()))
        }
    }
}

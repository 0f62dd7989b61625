//! Controllers for the director backup operator
//!
//! Each controller watches its CRD and drives the custom resources toward
//! the outcome they request.

mod backup_request;

pub use backup_request::{BackupRequestController, Saga};

use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;

/// Common trait for all controllers
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Start the controller's reconciliation loop
    async fn run(&self) -> Result<(), OperatorError>;

    /// Get the controller name for logging
    fn name(&self) -> &'static str;
}

/// Requeue delay after a failed reconcile, by error kind.
pub(crate) fn error_policy_backoff<K, C>(
    _obj: Arc<K>,
    error: &OperatorError,
    _ctx: Arc<C>,
) -> Action {
    let delay = match error {
        OperatorError::Conflict(_) => Duration::from_secs(5),
        // a fix needs a human; don't hammer the API meanwhile
        OperatorError::Configuration(_) | OperatorError::InvalidState(_) => {
            Duration::from_secs(300)
        }
        _ => Duration::from_secs(30),
    };
    Action::requeue(delay)
}

//! Detection and abort of operations that hold an MTA's lock.
//!
//! The service allows one lock holder per (MTA id, namespace, space). A new
//! operation cannot start while another one holds it, so any lock holder is
//! aborted and waited out before the caller proceeds.

use tracing::{info, warn};

use crate::client::MtaClient;
use crate::error::MtaError;
use crate::models::{Operation, OperationAction, OperationQuery, OperationState};
use crate::poll::Poller;

/// Pick the operation holding the lock for the given MTA, if any.
///
/// More than one holder violates the service's invariant; the first is
/// returned and the rest are logged.
#[must_use]
pub fn find_conflicting<'a>(
    operations: &'a [Operation],
    mta_id: &str,
    space: &str,
    namespace: &str,
) -> Option<&'a Operation> {
    let mut holders = operations
        .iter()
        .filter(|op| op.holds_lock_on(mta_id, space, namespace));
    let first = holders.next()?;

    let extra: Vec<&str> = holders.map(|op| op.process_id.as_str()).collect();
    if !extra.is_empty() {
        warn!(
            mta_id = %mta_id,
            space = %space,
            namespace = %namespace,
            chosen = %first.process_id,
            ignored = ?extra,
            "Multiple operations hold the same MTA lock"
        );
    }
    Some(first)
}

/// Aborts conflicting operations before a new one is started.
#[derive(Clone)]
pub struct ConflictResolver {
    poller: Poller,
}

impl ConflictResolver {
    /// Create a resolver that waits out aborts with the given poller.
    #[must_use]
    pub const fn new(poller: Poller) -> Self {
        Self { poller }
    }

    fn client(&self) -> &MtaClient {
        self.poller.client()
    }

    /// Fetch the active operation holding the lock for an MTA, if any.
    ///
    /// # Errors
    /// Returns error if the operations cannot be listed.
    pub async fn ongoing_operation(
        &self,
        space: &str,
        mta_id: &str,
        namespace: &str,
    ) -> Result<Option<Operation>, MtaError> {
        let operations = self
            .client()
            .list_operations(space, &OperationQuery::active_for(mta_id))
            .await
            .inspect_err(|e| {
                warn!(mta_id = %mta_id, error = %e, "Could not get ongoing operations");
            })?;

        Ok(find_conflicting(&operations, mta_id, space, namespace).cloned())
    }

    /// Abort any operation holding the lock for an MTA and wait until it is aborted.
    ///
    /// Returns the process id of the aborted operation, or `None` when there
    /// was no conflict. The caller must not start its own operation if this
    /// fails: the lock may still be held.
    ///
    /// # Errors
    /// Returns error if listing, aborting, or polling the abort fails.
    pub async fn resolve_conflict(
        &self,
        space: &str,
        mta_id: &str,
        namespace: &str,
    ) -> Result<Option<String>, MtaError> {
        let Some(conflicting) = self.ongoing_operation(space, mta_id, namespace).await? else {
            info!(mta_id = %mta_id, space = %space, "No conflicting operation");
            return Ok(None);
        };

        info!(
            mta_id = %mta_id,
            space = %space,
            process_id = %conflicting.process_id,
            state = %conflicting.state,
            "Aborting conflicting operation"
        );

        let operation_id = self
            .client()
            .execute_action(space, &conflicting.process_id, OperationAction::Abort)
            .await?;
        self.poller
            .poll_operation(space, &operation_id, OperationState::Aborted)
            .await?;

        info!(process_id = %conflicting.process_id, "Conflicting operation aborted");
        Ok(Some(conflicting.process_id))
    }
}

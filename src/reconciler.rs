use tracing::*;

use crate::charactercounter_types::*;
use crate::common::with_defaults;
use crate::converger::{converge, ControlledFields, Operation};
use crate::error::Error;
use crate::resources::{make_deployment, make_service};
use crate::store::{ObjectKey, Store, StoreError};

/// What one reconcile did to one managed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: &'static str,
    pub key: ObjectKey,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The CharacterCounter is gone; the store cascades the deletion to its
    /// children, so there is nothing left to do.
    Deleted,
    /// Every managed object was converged, in reconcile order.
    Converged(Vec<Change>),
}

impl ReconcileOutcome {
    pub fn changes(&self) -> &[Change] {
        match self {
            ReconcileOutcome::Deleted => &[],
            ReconcileOutcome::Converged(changes) => changes,
        }
    }

    /// Whether this reconcile issued any write.
    pub fn wrote(&self) -> bool {
        self.changes()
            .iter()
            .any(|change| change.operation != Operation::Unchanged)
    }
}

async fn converge_child<S, K>(store: &S, desired: K, cc: &CharacterCounter) -> Result<Change, Error>
where
    S: Store,
    K: ControlledFields,
{
    let key = ObjectKey::of(&desired).ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let operation = converge(store, &desired, cc).await?;
    Ok(Change {
        kind: K::KIND,
        key,
        operation,
    })
}

/// Converges the Services and Deployments of the CharacterCounter at `key`.
///
/// Keeps no state between calls. The first error aborts the remaining steps
/// and is returned as is; whatever was already written stays, and since each
/// object converges idempotently the next call picks up where this one
/// stopped.
pub async fn reconcile<S: Store>(store: &S, key: &ObjectKey) -> Result<ReconcileOutcome, Error> {
    info!("Reconciling CharacterCounter {}", key);

    // Get the CharacterCounter before taking any reconciliation actions.
    let cc = match store
        .get::<CharacterCounter>(&key.namespace, &key.name)
        .await
    {
        Err(StoreError::NotFound) => {
            info!("{} not found, end reconcile", key);
            return Ok(ReconcileOutcome::Deleted);
        }
        Err(e) => {
            return Err(Error::IntentGetFailed {
                key: key.clone(),
                source: e,
            })
        }
        Ok(cc) => with_defaults(cc),
    };

    let mut changes = Vec::with_capacity(Role::ORDER.len() * 2);
    for role in Role::ORDER {
        debug!("{} reconcile {} service", key, role);
        changes.push(converge_child(store, make_service(&cc, role), &cc).await?);
        debug!("{} reconcile {} deployment", key, role);
        changes.push(converge_child(store, make_deployment(&cc, role), &cc).await?);
    }
    Ok(ReconcileOutcome::Converged(changes))
}

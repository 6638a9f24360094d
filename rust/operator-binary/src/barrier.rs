//! Finalizer handling that keeps an object around until its external cleanup has succeeded.

use snafu::{ResultExt, Snafu};
use stackable_operator::kube::ResourceExt;

use crate::store::{self, Object, Store};

pub const FINALIZER: &str = "vpn.stackable.tech/pki-cleanup";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to add finalizer"))]
    AddFinalizer { source: store::Error },

    #[snafu(display("failed to remove finalizer"))]
    RemoveFinalizer { source: store::Error },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::AddFinalizer { source } | Error::RemoveFinalizer { source } => {
                source.is_conflict()
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Not seen before, no finalizer yet.
    New,
    Active,
    /// Deletion was requested, cleanup still pending.
    Deleting,
    /// Deletion was requested and cleanup has finished, the object is about to disappear.
    Gone,
}

pub fn phase<K: Object>(obj: &K) -> Phase {
    let has_finalizer = obj.finalizers().iter().any(|f| f == FINALIZER);
    match (obj.meta().deletion_timestamp.is_some(), has_finalizer) {
        (false, false) => Phase::New,
        (false, true) => Phase::Active,
        (true, true) => Phase::Deleting,
        (true, false) => Phase::Gone,
    }
}

/// What the reconciler should do with the object next.
#[derive(Debug)]
pub enum Step<K> {
    /// Converge the object, the finalizer is in place.
    Converge(K),
    /// Run cleanup, then call [`release`].
    Cleanup(K),
    /// Nothing left to do.
    Done,
}

/// Moves the object through the barrier, adding the finalizer before anything else happens.
///
/// A concurrent modification fails the attempt, the next reconcile starts over from a fresh read.
pub async fn enter<S: Store, K: Object>(store: &S, obj: &K) -> Result<Step<K>, Error> {
    match phase(obj) {
        Phase::New => {
            let mut obj = obj.clone();
            obj.finalizers_mut().push(FINALIZER.to_string());
            let obj = store.update(&obj).await.context(AddFinalizerSnafu)?;
            tracing::debug!(object = %obj.name_any(), "added finalizer");
            Ok(Step::Converge(obj))
        }
        Phase::Active => Ok(Step::Converge(obj.clone())),
        Phase::Deleting => Ok(Step::Cleanup(obj.clone())),
        Phase::Gone => Ok(Step::Done),
    }
}

/// Lifts the barrier after successful cleanup. The object is garbage collected afterwards.
pub async fn release<S: Store, K: Object>(store: &S, obj: &K) -> Result<(), Error> {
    let mut obj = obj.clone();
    obj.finalizers_mut().retain(|f| f != FINALIZER);
    store.update(&obj).await.context(RemoveFinalizerSnafu)?;
    tracing::debug!(object = %obj.name_any(), "removed finalizer");
    Ok(())
}

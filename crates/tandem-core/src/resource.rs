//! Resource contract.
//!
//! Every archetype resource — local cell, channel, network mailbox, CRDT —
//! implements [`ArchetypeResource`], the state machine the scheduler drives:
//! tentative reads and writes during a critical-section attempt, then
//! exactly one terminal call (`commit` or `abort`) per touched resource
//! before the next section begins.
//!
//! Guarantees the scheduler depends on:
//!
//! 1. *Read-your-writes*: `read` reflects writes performed in the current
//!    attempt on top of committed state.
//! 2. *Snapshot isolation*: after `abort`, reads reflect the state prior to
//!    the failed attempt.
//! 3. *Idempotent terminals*: `commit`/`abort` with no tentative state is a
//!    no-op.
//! 4. *Suspendability*: `pre_commit` and `commit` may block on I/O; `read`
//!    and `write` are non-blocking unless the variant documents otherwise
//!    (a mailbox read blocks on an empty inbox).
//!
//! `commit` is infallible: a resource that cannot install its tentative
//! writes after a successful `pre_commit` is a programming error.

use async_trait::async_trait;

use crate::errors::RuntimeResult;
use crate::value::Value;

/// The contract every archetype resource obeys.
#[async_trait]
pub trait ArchetypeResource: Send {
    /// Read a value consistent with the current attempt's writes. For
    /// addressable resources the index path selects the slot; leaf
    /// resources expect an empty path.
    async fn read(&mut self, index: &[Value]) -> RuntimeResult<Value>;

    /// Record a tentative write, invisible to other participants until
    /// `commit`.
    async fn write(&mut self, index: &[Value], value: Value) -> RuntimeResult<()>;

    /// First commit phase: report whether the commit can proceed. May block
    /// on I/O. An error converts the in-flight commit into an abort across
    /// all touched resources.
    async fn pre_commit(&mut self) -> RuntimeResult<()>;

    /// Install tentative writes irrevocably. Must not fail.
    async fn commit(&mut self);

    /// Discard tentative writes, restoring the pre-attempt snapshot.
    async fn abort(&mut self);

    /// Release whatever the resource holds (connections, background tasks).
    /// Called once when the owning context shuts down; errors are logged by
    /// the context, not propagated.
    async fn close(&mut self) -> RuntimeResult<()>;
}

/// Opaque handle to a resource registered in an archetype context.
///
/// Handles are arena indices resolved once at registration, so section
/// bodies never pay a per-step name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(usize);

impl ResourceHandle {
    /// Wrap an arena index. Only context implementations construct handles.
    pub fn from_index(index: usize) -> Self {
        ResourceHandle(index)
    }

    /// The arena index this handle designates.
    pub fn index(self) -> usize {
        self.0
    }
}

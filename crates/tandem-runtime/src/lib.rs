//! # Tandem Runtime
//!
//! Execution engine for distributed algorithms compiled from a high-level
//! specification language. A compiled process is an *archetype*: labeled
//! critical sections reading and writing named resources. This crate owns
//! the critical-section scheduler and its two-phase commit over the
//! resource contract defined in `tandem-core`, the archetype context and
//! interface the compiled bodies call, the process-initialization barrier,
//! and the framed RPC transport shared with the replicated resources in
//! `tandem-resources`.

pub mod archetype;
pub mod barrier;
pub mod context;
pub mod fairness;
pub mod interface;
pub mod rpc;
pub mod scheduler;

pub use archetype::{Archetype, CriticalSection, JumpTable, ProcTable, SectionBody, SectionFuture};
pub use barrier::{BarrierConfig, ProcessBarrier, PROCESS_SERVICE};
pub use context::{ArchetypeContext, ContextBuilder, ContextCloser};
pub use interface::{ArchetypeInterface, Constant};
pub use rpc::{RpcClient, RpcServer, RpcService};

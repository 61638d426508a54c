//! # Tandem Resources
//!
//! Built-in archetype resources: the in-memory channels that bridge an
//! algorithm to its harness, the placeholder for unwired parameters, and
//! the gossip-replicated grow-only counter. Each implements the resource
//! contract from `tandem-core`, so the scheduler coordinates them exactly
//! like any other resource. The local cell lives in `tandem-core` itself,
//! where the context uses it to seed value parameters.

pub mod channel;
pub mod gcounter;
pub mod placeholder;

pub use channel::{input_channel, output_channel, InputChannel, OutputChannel};
pub use gcounter::{CounterMap, GCounter, GCounterConfig, ReceiveValueArgs, GCOUNTER_SERVICE};
pub use placeholder::Placeholder;

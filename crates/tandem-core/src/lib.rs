//! # Tandem Core
//!
//! Foundation layer for the tandem runtime: the opaque value model shared by
//! every compiled algorithm, the unified error taxonomy, and the resource
//! contract that archetype resources implement.
//!
//! This crate depends only on external libraries. The scheduler, the
//! archetype context, and the built-in resources live in `tandem-runtime`
//! and `tandem-resources`.

pub mod errors;
pub mod local;
pub mod resource;
pub mod value;

pub use errors::{RuntimeError, RuntimeResult};
pub use local::LocalResource;
pub use resource::{ArchetypeResource, ResourceHandle};
pub use value::Value;

//! Archetype context: construction, configuration, and shutdown.
//!
//! A context pairs one archetype instance with its bound resources and
//! constants. The builder mirrors how a compiled system wires a process:
//! define constants and operators, bind every required ref and value
//! parameter, then `finish()` validates the bindings and runs the
//! archetype's preamble once. `run()` (in the scheduler module) drives the
//! critical-section loop until completion or close.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use tandem_core::{ArchetypeResource, LocalResource, RuntimeError, RuntimeResult, Value};

use crate::archetype::Archetype;
use crate::interface::{ArchetypeInterface, Constant};

/// Handle that closes a context from another task. Cloneable; close is
/// idempotent.
#[derive(Clone)]
pub struct ContextCloser {
    tx: Arc<watch::Sender<bool>>,
}

impl ContextCloser {
    /// Signal close. Every pending and subsequent resource operation in
    /// the context resolves to `ContextClosed`.
    pub fn close(&self) {
        let _ = self.tx.send(true);
    }
}

/// One archetype instance wired to its resources and constants.
pub struct ArchetypeContext {
    pub(crate) archetype: Archetype,
    pub(crate) iface: ArchetypeInterface,
    close_tx: Arc<watch::Sender<bool>>,
    resources_closed: bool,
}

impl std::fmt::Debug for ArchetypeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchetypeContext")
            .field("archetype", &self.archetype.name)
            .field("resources_closed", &self.resources_closed)
            .finish()
    }
}

impl ArchetypeContext {
    /// Start configuring a context for `archetype`, run as instance
    /// `self_id`.
    pub fn builder(archetype: Archetype, self_id: Value) -> ContextBuilder {
        ContextBuilder {
            archetype,
            self_id,
            constants: HashMap::new(),
            ref_params: Vec::new(),
            val_params: Vec::new(),
        }
    }

    /// Handle for closing this context while `run()` executes elsewhere.
    pub fn closer(&self) -> ContextCloser {
        ContextCloser {
            tx: Arc::clone(&self.close_tx),
        }
    }

    /// The interface, for evaluating constants or resolving handles
    /// outside the run loop.
    pub fn interface(&mut self) -> &mut ArchetypeInterface {
        &mut self.iface
    }

    /// Close the context: cancel any in-flight section and release every
    /// resource. Idempotent; resource close failures are logged, not
    /// propagated.
    pub async fn close(&mut self) {
        let _ = self.close_tx.send(true);
        if !self.resources_closed {
            self.resources_closed = true;
            tracing::debug!(archetype = self.archetype.name, "closing context");
            self.iface.close_resources().await;
        }
    }
}

/// Builder for [`ArchetypeContext`].
pub struct ContextBuilder {
    archetype: Archetype,
    self_id: Value,
    constants: HashMap<String, Constant>,
    ref_params: Vec<(String, Box<dyn ArchetypeResource>)>,
    val_params: Vec<(String, Value)>,
}

impl ContextBuilder {
    /// Define a value constant.
    pub fn define_constant(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.constants
            .insert(name.to_string(), Constant::value(value));
        self
    }

    /// Define an operator constant: a pure function of values.
    pub fn define_operator(
        mut self,
        name: &str,
        f: impl Fn(&[Value]) -> RuntimeResult<Value> + Send + Sync + 'static,
    ) -> Self {
        self.constants
            .insert(name.to_string(), Constant::operator(f));
        self
    }

    /// Bind a required reference parameter to a resource.
    pub fn bind_ref_param(
        mut self,
        name: &str,
        resource: impl ArchetypeResource + 'static,
    ) -> Self {
        self.ref_params.push((name.to_string(), Box::new(resource)));
        self
    }

    /// Bind a required value parameter; it becomes a local resource seeded
    /// with `initial`.
    pub fn bind_value_param(mut self, name: &str, initial: impl Into<Value>) -> Self {
        self.val_params.push((name.to_string(), initial.into()));
        self
    }

    /// Validate the bindings against the archetype's requirements, run the
    /// preamble, and return the runnable context.
    pub async fn finish(self) -> RuntimeResult<ArchetypeContext> {
        let (tx, rx) = watch::channel(false);
        let mut iface = ArchetypeInterface::new(self.self_id, self.constants, rx);

        for (name, resource) in self.ref_params {
            iface.register_ref(name, resource);
        }
        for (name, initial) in self.val_params {
            iface.register(name, Box::new(LocalResource::new(initial)));
        }

        for required in self.archetype.required_ref_params {
            iface.require_resource_ref(required).map_err(|_| {
                RuntimeError::internal(format!(
                    "archetype {} ref parameter {required} was never bound",
                    self.archetype.name
                ))
            })?;
        }
        for required in self.archetype.required_val_params {
            if !iface.has_resource(required) {
                return Err(RuntimeError::internal(format!(
                    "archetype {} value parameter {required} was never bound",
                    self.archetype.name
                )));
            }
        }

        if let Some(preamble) = self.archetype.preamble {
            preamble(&mut iface).await?;
        }

        Ok(ArchetypeContext {
            archetype: self.archetype,
            iface,
            close_tx: Arc::new(tx),
            resources_closed: false,
        })
    }
}

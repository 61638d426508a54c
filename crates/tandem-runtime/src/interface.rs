//! Archetype interface: the facade critical-section bodies call.
//!
//! The interface owns the resource arena, routes reads and writes to
//! resources while recording which ones the current attempt touched, hands
//! out fairness-counter draws, resolves configured constants, and carries
//! the `goto` directive from the body back to the scheduler.
//!
//! Every resource operation races the context close signal, so a closed
//! context turns any in-flight or subsequent operation into
//! [`RuntimeError::ContextClosed`], which the scheduler treats as clean
//! termination.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;

use tandem_core::{ArchetypeResource, ResourceHandle, RuntimeError, RuntimeResult, Value};

use crate::fairness::FairnessCounters;

/// A configured constant: either a plain value or a pure operator over
/// values.
#[derive(Clone)]
pub enum Constant {
    /// A constant value
    Value(Value),
    /// A pure function of values, e.g. `COMBINE_FN(a, b)`
    Operator(Arc<dyn Fn(&[Value]) -> RuntimeResult<Value> + Send + Sync>),
}

impl Constant {
    /// Wrap a value constant
    pub fn value(v: impl Into<Value>) -> Self {
        Constant::Value(v.into())
    }

    /// Wrap an operator constant
    pub fn operator(
        f: impl Fn(&[Value]) -> RuntimeResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Constant::Operator(Arc::new(f))
    }
}

/// Facade given to critical-section bodies and preambles.
pub struct ArchetypeInterface {
    self_id: Value,
    constants: HashMap<String, Constant>,
    resources: Vec<Box<dyn ArchetypeResource>>,
    names: HashMap<String, ResourceHandle>,
    ref_params: HashSet<String>,
    touched: BTreeSet<usize>,
    fairness: FairnessCounters,
    next_label: Option<String>,
    closed: watch::Receiver<bool>,
}

impl ArchetypeInterface {
    pub(crate) fn new(
        self_id: Value,
        constants: HashMap<String, Constant>,
        closed: watch::Receiver<bool>,
    ) -> Self {
        ArchetypeInterface {
            self_id,
            constants,
            resources: Vec::new(),
            names: HashMap::new(),
            ref_params: HashSet::new(),
            touched: BTreeSet::new(),
            fairness: FairnessCounters::default(),
            next_label: None,
            closed,
        }
    }

    /// A resource-less interface carrying only constants. Lets tests and
    /// tooling evaluate constant operators outside any archetype, the way
    /// compiled definitions like `NUM_NODES(iface)` are checked.
    pub fn constants_only(constants: impl IntoIterator<Item = (String, Constant)>) -> Self {
        let (_tx, rx) = watch::channel(false);
        // the sender is dropped on purpose: a constants-only interface has
        // nothing to cancel
        Self::new(Value::unit(), constants.into_iter().collect(), rx)
    }

    /// The id of this archetype instance.
    pub fn self_id(&self) -> Value {
        self.self_id.clone()
    }

    /// The configured value constant `name`.
    pub fn get_constant(&self, name: &str) -> RuntimeResult<Value> {
        match self.constants.get(name) {
            Some(Constant::Value(v)) => Ok(v.clone()),
            Some(Constant::Operator(_)) => Err(RuntimeError::internal(format!(
                "constant {name} is an operator; apply it to arguments"
            ))),
            None => Err(RuntimeError::internal(format!(
                "archetype requires undefined constant {name}"
            ))),
        }
    }

    /// Apply the configured operator constant `name` to `args`. A value
    /// constant applied to no arguments behaves as a zero-argument
    /// operator.
    pub fn apply_constant(&self, name: &str, args: &[Value]) -> RuntimeResult<Value> {
        match self.constants.get(name) {
            Some(Constant::Operator(f)) => f(args),
            Some(Constant::Value(v)) if args.is_empty() => Ok(v.clone()),
            Some(Constant::Value(_)) => Err(RuntimeError::internal(format!(
                "value constant {name} applied to {} arguments",
                args.len()
            ))),
            None => Err(RuntimeError::internal(format!(
                "archetype requires undefined constant {name}"
            ))),
        }
    }

    /// Handle of the named resource. The name must have been bound as a
    /// parameter or seeded by the preamble.
    pub fn require_resource(&self, name: &str) -> RuntimeResult<ResourceHandle> {
        self.names.get(name).copied().ok_or_else(|| {
            RuntimeError::internal(format!("archetype requires unregistered resource {name}"))
        })
    }

    /// Handle of the named reference parameter. Errors when the name was
    /// never bound with `bind_ref_param`.
    pub fn require_resource_ref(&self, name: &str) -> RuntimeResult<ResourceHandle> {
        if !self.ref_params.contains(name) {
            return Err(RuntimeError::internal(format!(
                "resource {name} was not bound as a ref parameter"
            )));
        }
        self.require_resource(name)
    }

    /// Register a local resource seeded with `initial`. Preamble-only.
    pub fn ensure_resource_local(&mut self, name: &str, initial: Value) -> ResourceHandle {
        if let Some(handle) = self.names.get(name) {
            return *handle;
        }
        self.register(name.to_string(), Box::new(tandem_core::LocalResource::new(initial)))
    }

    /// Committed value of a named local resource, without recording a
    /// touch. Preamble-only: lets one local seed another.
    pub async fn read_local(&mut self, name: &str) -> RuntimeResult<Value> {
        let handle = self.require_resource(name)?;
        self.resources[handle.index()].read(&[]).await
    }

    /// Read through the named resource, recording it as touched.
    pub async fn read(&mut self, handle: ResourceHandle, index: &[Value]) -> RuntimeResult<Value> {
        let resource = self
            .resources
            .get_mut(handle.index())
            .ok_or_else(|| RuntimeError::internal("read through dangling resource handle"))?;
        self.touched.insert(handle.index());
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return Err(RuntimeError::ContextClosed);
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(RuntimeError::ContextClosed),
            result = resource.read(index) => result,
        }
    }

    /// Write through the named resource, recording it as touched.
    pub async fn write(
        &mut self,
        handle: ResourceHandle,
        index: &[Value],
        value: Value,
    ) -> RuntimeResult<()> {
        let resource = self
            .resources
            .get_mut(handle.index())
            .ok_or_else(|| RuntimeError::internal("write through dangling resource handle"))?;
        self.touched.insert(handle.index());
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return Err(RuntimeError::ContextClosed);
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => Err(RuntimeError::ContextClosed),
            result = resource.write(index, value) => result,
        }
    }

    /// Set the label the scheduler advances to after this section commits.
    /// The returned `Ok(())` is the value a body returns to continue.
    pub fn goto(&mut self, label: &str) -> RuntimeResult<()> {
        self.next_label = Some(label.to_string());
        Ok(())
    }

    /// Signal algorithm completion. Bodies return this directly.
    pub fn done(&self) -> RuntimeResult<()> {
        Err(RuntimeError::Done)
    }

    /// Fail the section with `AssertionFailed` when `condition` is false.
    pub fn assert(&self, condition: bool, message: &str) -> RuntimeResult<()> {
        if condition {
            Ok(())
        } else {
            Err(RuntimeError::assertion_failed(message))
        }
    }

    /// Next round-robin index in `[0, modulus)` for the branch site.
    /// Advances whether the attempt later commits or aborts.
    pub fn next_fairness_counter(&mut self, site: &str, modulus: usize) -> usize {
        self.fairness.next(site, modulus)
    }

    /// Whether the owning context has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn register(
        &mut self,
        name: String,
        resource: Box<dyn ArchetypeResource>,
    ) -> ResourceHandle {
        let handle = ResourceHandle::from_index(self.resources.len());
        self.resources.push(resource);
        self.names.insert(name, handle);
        handle
    }

    pub(crate) fn register_ref(
        &mut self,
        name: String,
        resource: Box<dyn ArchetypeResource>,
    ) -> ResourceHandle {
        self.ref_params.insert(name.clone());
        self.register(name, resource)
    }

    pub(crate) fn has_resource(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Reset per-attempt state before running a section body.
    pub(crate) fn begin_section(&mut self) {
        self.touched.clear();
        self.next_label = None;
    }

    pub(crate) fn take_next_label(&mut self) -> Option<String> {
        self.next_label.take()
    }

    /// First commit phase over the touched resources in stable arena
    /// order. Stops at the first failure; the caller then aborts all.
    pub(crate) async fn pre_commit_touched(&mut self) -> RuntimeResult<()> {
        let touched: Vec<usize> = self.touched.iter().copied().collect();
        for idx in touched {
            let resource = &mut self.resources[idx];
            let mut closed = self.closed.clone();
            let result = tokio::select! {
                biased;
                _ = closed.wait_for(|c| *c) => Err(RuntimeError::ContextClosed),
                result = resource.pre_commit() => result,
            };
            result?;
        }
        Ok(())
    }

    /// Second commit phase: install every touched resource's tentative
    /// state. Empties the touched set.
    pub(crate) async fn commit_touched(&mut self) {
        for idx in std::mem::take(&mut self.touched) {
            self.resources[idx].commit().await;
        }
    }

    /// Terminal abort: roll every touched resource back to its
    /// pre-attempt snapshot. Empties the touched set.
    pub(crate) async fn abort_touched(&mut self) {
        for idx in std::mem::take(&mut self.touched) {
            self.resources[idx].abort().await;
        }
    }

    pub(crate) fn touched_is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    /// Close every resource, logging rather than propagating failures.
    pub(crate) async fn close_resources(&mut self) {
        for (idx, resource) in self.resources.iter_mut().enumerate() {
            if let Err(err) = resource.close().await {
                tracing::warn!(resource = idx, error = %err, "resource close failed");
            }
        }
    }
}

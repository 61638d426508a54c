//! Archetype definitions.
//!
//! An archetype is a compiled process program: a jump table from labels to
//! critical-section bodies, the name of the initial label, the parameters a
//! context must bind before running, and a preamble that seeds local
//! resources. The compiler emits one [`Archetype`] per process kind; the
//! scheduler in this crate drives it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tandem_core::RuntimeResult;

use crate::interface::ArchetypeInterface;

/// Future returned by a critical-section body.
pub type SectionFuture<'a> = Pin<Box<dyn Future<Output = RuntimeResult<()>> + Send + 'a>>;

/// A critical-section body: one atomic attempt over the resources it
/// touches. Bodies end by returning `iface.goto(label)`, `iface.done()`, or
/// an error the scheduler dispatches on.
pub type SectionBody = for<'a> fn(&'a mut ArchetypeInterface) -> SectionFuture<'a>;

/// A labeled critical section.
pub struct CriticalSection {
    /// Fully qualified label, e.g. `"ATestRig.loop"`
    pub name: &'static str,
    /// The section body
    pub body: SectionBody,
}

/// Dispatch table from label to critical-section body.
pub struct JumpTable {
    sections: HashMap<&'static str, CriticalSection>,
}

impl JumpTable {
    /// Build a jump table from its sections. Duplicate labels are a
    /// compiler bug and panic here rather than silently shadowing.
    pub fn new(sections: impl IntoIterator<Item = CriticalSection>) -> Self {
        let mut table = HashMap::new();
        for section in sections {
            let name = section.name;
            if table.insert(name, section).is_some() {
                panic!("duplicate critical section label {name}");
            }
        }
        JumpTable { sections: table }
    }

    /// The body registered for `label`, if any.
    pub fn body_of(&self, label: &str) -> Option<SectionBody> {
        self.sections.get(label).map(|s| s.body)
    }
}

/// Table of procedures referenced by an archetype. Procedures compile
/// into ordinary jump-table labels; none of the archetypes here carry
/// any, so the table is an empty marker.
#[derive(Debug, Default)]
pub struct ProcTable;

impl ProcTable {
    /// An empty procedure table, for archetypes without procedures.
    pub fn empty() -> Self {
        Self
    }
}

/// A compiled process program.
pub struct Archetype {
    /// Archetype name, e.g. `"ATestRig"`
    pub name: &'static str,
    /// Label execution starts at
    pub initial_label: &'static str,
    /// Reference parameters a context must bind with `bind_ref_param`
    pub required_ref_params: &'static [&'static str],
    /// Value parameters a context must bind with `bind_value_param`
    pub required_val_params: &'static [&'static str],
    /// Label dispatch table
    pub jump_table: JumpTable,
    /// Procedures referenced by the jump table
    pub proc_table: ProcTable,
    /// Runs once before the first critical section to seed local
    /// resources. `None` when the archetype has no locals beyond its
    /// parameters.
    pub preamble: Option<SectionBody>,
}

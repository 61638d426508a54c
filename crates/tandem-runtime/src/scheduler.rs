//! Critical-section scheduler.
//!
//! The run loop dispatches the current label through the jump table, runs
//! the section body as one atomic attempt, and drives the two-phase commit
//! over the resources the attempt touched. Four outcomes steer it:
//!
//! - `Ok(())` with a recorded `goto`: pre-commit every touched resource in
//!   stable order; any failure aborts them all and retries the same label,
//!   otherwise commit and advance.
//! - `CriticalSectionAborted`: a precondition is not yet satisfied; abort
//!   the touched resources, yield, and re-run the same label.
//! - `Done`: commit the touched resources and terminate cleanly.
//! - `ContextClosed`: abort the touched resources and terminate cleanly.
//!
//! Anything else aborts the touched resources and propagates. Termination
//! on the body's terms is the body's responsibility: a section that aborts
//! forever is retried forever.

use tandem_core::{RuntimeError, RuntimeResult};

use crate::context::ArchetypeContext;

impl ArchetypeContext {
    /// Drive the archetype from its initial label until it signals `Done`,
    /// the context is closed (both return `Ok`), or a fatal error
    /// surfaces. The touched-set is empty at every loop boundary.
    pub async fn run(&mut self) -> RuntimeResult<()> {
        let mut label = self.archetype.initial_label.to_string();
        tracing::debug!(
            archetype = self.archetype.name,
            initial = %label,
            "starting archetype"
        );

        loop {
            if self.iface.is_closed() {
                return Ok(());
            }

            let body = self.archetype.jump_table.body_of(&label).ok_or_else(|| {
                RuntimeError::internal(format!(
                    "archetype {} jumped to undefined label {label}",
                    self.archetype.name
                ))
            })?;

            self.iface.begin_section();
            let outcome = body(&mut self.iface).await;

            match outcome {
                Ok(()) => {
                    let next = self.iface.take_next_label().ok_or_else(|| {
                        RuntimeError::internal(format!(
                            "section {label} returned without goto or done"
                        ))
                    })?;
                    match self.iface.pre_commit_touched().await {
                        Ok(()) => {
                            self.iface.commit_touched().await;
                            tracing::trace!(from = %label, to = %next, "section committed");
                            label = next;
                        }
                        Err(RuntimeError::ContextClosed) => {
                            self.iface.abort_touched().await;
                            return Ok(());
                        }
                        Err(err) => {
                            // a pre-commit refusal converts the in-flight
                            // commit into a full abort and a retry
                            tracing::trace!(label = %label, error = %err, "pre-commit refused");
                            self.iface.abort_touched().await;
                            tokio::task::yield_now().await;
                        }
                    }
                }
                Err(RuntimeError::CriticalSectionAborted) => {
                    self.iface.abort_touched().await;
                    tokio::task::yield_now().await;
                }
                Err(RuntimeError::Done) => {
                    self.iface.commit_touched().await;
                    tracing::debug!(archetype = self.archetype.name, "archetype terminated");
                    return Ok(());
                }
                Err(RuntimeError::ContextClosed) => {
                    self.iface.abort_touched().await;
                    tracing::debug!(archetype = self.archetype.name, "context closed mid-run");
                    return Ok(());
                }
                Err(err) => {
                    self.iface.abort_touched().await;
                    tracing::warn!(
                        archetype = self.archetype.name,
                        label = %label,
                        error = %err,
                        "archetype failed"
                    );
                    return Err(err);
                }
            }

            debug_assert!(self.iface.touched_is_empty(), "terminal call leaked a resource");
        }
    }
}

//! Channel resources: the bridge between an archetype and the harness
//! around it.
//!
//! An input channel feeds values into an algorithm; reads block until a
//! value arrives. Values consumed by an attempt that later aborts are
//! pushed back and observed again by the retry, preserving the
//! exactly-once-per-commit discipline. An output channel buffers writes
//! tentatively and flushes them, in order, only on commit.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tandem_core::{ArchetypeResource, RuntimeError, RuntimeResult, Value};

fn require_leaf(index: &[Value]) -> RuntimeResult<()> {
    if index.is_empty() {
        Ok(())
    } else {
        Err(RuntimeError::internal("channel resources take no index"))
    }
}

/// Read side of a harness-fed channel.
pub struct InputChannel {
    rx: mpsc::Receiver<Value>,
    /// Values handed back by aborted attempts, replayed before the channel
    backlog: VecDeque<Value>,
    /// Values consumed by the current attempt
    consumed: Vec<Value>,
}

impl InputChannel {
    /// Wrap the receive half of a channel.
    pub fn new(rx: mpsc::Receiver<Value>) -> Self {
        InputChannel {
            rx,
            backlog: VecDeque::new(),
            consumed: Vec::new(),
        }
    }
}

/// A connected (sender, input resource) pair.
pub fn input_channel(buffer: usize) -> (mpsc::Sender<Value>, InputChannel) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, InputChannel::new(rx))
}

#[async_trait]
impl ArchetypeResource for InputChannel {
    async fn read(&mut self, index: &[Value]) -> RuntimeResult<Value> {
        require_leaf(index)?;
        let value = match self.backlog.pop_front() {
            Some(value) => value,
            // the sender dropping means the harness is done feeding us;
            // treat it as cancellation
            None => self.rx.recv().await.ok_or(RuntimeError::ContextClosed)?,
        };
        self.consumed.push(value.clone());
        Ok(value)
    }

    async fn write(&mut self, _index: &[Value], _value: Value) -> RuntimeResult<()> {
        Err(RuntimeError::internal("input channel is read-only"))
    }

    async fn pre_commit(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn commit(&mut self) {
        self.consumed.clear();
    }

    async fn abort(&mut self) {
        for value in self.consumed.drain(..).rev() {
            self.backlog.push_front(value);
        }
    }

    async fn close(&mut self) -> RuntimeResult<()> {
        self.rx.close();
        Ok(())
    }
}

/// Write side of a harness-observed channel.
pub struct OutputChannel {
    tx: mpsc::Sender<Value>,
    buffer: Vec<Value>,
}

impl OutputChannel {
    /// Wrap the send half of a channel.
    pub fn new(tx: mpsc::Sender<Value>) -> Self {
        OutputChannel {
            tx,
            buffer: Vec::new(),
        }
    }
}

/// A connected (output resource, receiver) pair.
pub fn output_channel(buffer: usize) -> (OutputChannel, mpsc::Receiver<Value>) {
    let (tx, rx) = mpsc::channel(buffer);
    (OutputChannel::new(tx), rx)
}

#[async_trait]
impl ArchetypeResource for OutputChannel {
    async fn read(&mut self, _index: &[Value]) -> RuntimeResult<Value> {
        Err(RuntimeError::internal("output channel is write-only"))
    }

    async fn write(&mut self, index: &[Value], value: Value) -> RuntimeResult<()> {
        require_leaf(index)?;
        self.buffer.push(value);
        Ok(())
    }

    async fn pre_commit(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn commit(&mut self) {
        for value in std::mem::take(&mut self.buffer) {
            if self.tx.send(value).await.is_err() {
                // commit must not fail; a dropped consumer just loses the rest
                tracing::warn!("output channel consumer dropped, discarding committed writes");
                return;
            }
        }
    }

    async fn abort(&mut self) {
        self.buffer.clear();
    }

    async fn close(&mut self) -> RuntimeResult<()> {
        Ok(())
    }
}

//! Local archetype resource: an in-memory cell.
//!
//! The slot holds one [`Value`]. The first write of an attempt snapshots
//! the committed value; `abort` restores it and `commit` discards it, so
//! rollback is a pointer swap thanks to the value model's structural
//! sharing. An empty index path addresses the whole slot; a non-empty path
//! functionally rewrites the nested record spine.

use async_trait::async_trait;

use crate::errors::RuntimeResult;
use crate::resource::ArchetypeResource;
use crate::value::Value;

/// Single-slot in-memory resource with snapshot rollback.
#[derive(Debug)]
pub struct LocalResource {
    value: Value,
    snapshot: Option<Value>,
}

impl LocalResource {
    /// A local resource seeded with `initial`.
    pub fn new(initial: Value) -> Self {
        LocalResource {
            value: initial,
            snapshot: None,
        }
    }
}

#[async_trait]
impl ArchetypeResource for LocalResource {
    async fn read(&mut self, index: &[Value]) -> RuntimeResult<Value> {
        self.value.index(index)
    }

    async fn write(&mut self, index: &[Value], value: Value) -> RuntimeResult<()> {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.value.clone());
        }
        self.value = self.value.with_index(index, value)?;
        Ok(())
    }

    async fn pre_commit(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn commit(&mut self) {
        self.snapshot = None;
    }

    async fn abort(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.value = snapshot;
        }
    }

    async fn close(&mut self) -> RuntimeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_your_writes_then_commit() {
        let mut cell = LocalResource::new(Value::number(0));
        cell.write(&[], Value::number(5)).await.unwrap();
        assert_eq!(cell.read(&[]).await.unwrap(), Value::number(5));
        cell.commit().await;
        assert_eq!(cell.read(&[]).await.unwrap(), Value::number(5));
    }

    #[tokio::test]
    async fn abort_restores_snapshot() {
        let mut cell = LocalResource::new(Value::number(1));
        cell.write(&[], Value::number(9)).await.unwrap();
        cell.write(&[], Value::number(10)).await.unwrap();
        cell.abort().await;
        assert_eq!(cell.read(&[]).await.unwrap(), Value::number(1));
        // terminal call with no tentative state is a no-op
        cell.abort().await;
        assert_eq!(cell.read(&[]).await.unwrap(), Value::number(1));
    }

    #[tokio::test]
    async fn indexed_writes_rewrite_nested_records() {
        let mut cell = LocalResource::new(Value::record([(
            Value::number(1),
            Value::number(0),
        )]));
        cell.write(&[Value::number(1)], Value::number(7)).await.unwrap();
        cell.write(&[Value::number(2)], Value::number(3)).await.unwrap();
        assert_eq!(
            cell.read(&[Value::number(1)]).await.unwrap(),
            Value::number(7)
        );
        cell.abort().await;
        assert_eq!(
            cell.read(&[Value::number(1)]).await.unwrap(),
            Value::number(0)
        );
        assert!(cell.read(&[Value::number(2)]).await.is_err());
    }
}

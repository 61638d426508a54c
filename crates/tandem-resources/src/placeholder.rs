//! Placeholder resource for unwired reference parameters.
//!
//! Accepts every operation as a no-op; reads yield the unit value. Lets a
//! test bind an archetype whose bodies never actually reach a given ref
//! parameter.

use async_trait::async_trait;

use tandem_core::{ArchetypeResource, RuntimeResult, Value};

/// Resource that accepts everything and does nothing.
#[derive(Debug, Default)]
pub struct Placeholder;

#[async_trait]
impl ArchetypeResource for Placeholder {
    async fn read(&mut self, _index: &[Value]) -> RuntimeResult<Value> {
        Ok(Value::unit())
    }

    async fn write(&mut self, _index: &[Value], _value: Value) -> RuntimeResult<()> {
        Ok(())
    }

    async fn pre_commit(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn commit(&mut self) {}

    async fn abort(&mut self) {}

    async fn close(&mut self) -> RuntimeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_is_accepted() {
        let mut placeholder = Placeholder;
        assert_eq!(placeholder.read(&[]).await.unwrap(), Value::unit());
        placeholder
            .write(&[Value::number(1)], Value::number(5))
            .await
            .unwrap();
        placeholder.pre_commit().await.unwrap();
        placeholder.commit().await;
        placeholder.abort().await;
        placeholder.close().await.unwrap();
    }
}

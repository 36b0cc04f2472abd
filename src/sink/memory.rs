use async_trait::async_trait;
use parking_lot::Mutex;

use super::Sink;
use crate::{error::DeliveryError, Batch};

/// Keeps every delivered batch in memory.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    batches: Mutex<Vec<Batch>>,
}
impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(vec![]),
        }
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }
    pub fn count(&self) -> usize {
        self.batches.lock().len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }
}

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    database::{Attributes, DocumentStore, ID_FIELD, Record},
    error::StoreError,
};

/// In-process document store for `memory://` and tests. Each operation runs under one
/// lock, so it is as atomic as the Redis commands it stands in for.
#[derive(Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, u64>>,
    records: Mutex<HashMap<(String, Uuid), Attributes>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_documents(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

fn strip_id(mut attributes: Attributes) -> Attributes {
    attributes.remove(ID_FIELD);
    attributes
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn increment(&self, sentinel: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let mut counters = self.counters.lock();
        let count = counters.entry(sentinel.to_string()).or_insert(0);
        *count += 1;

        Ok(*count)
    }

    async fn insert(&self, collection: &str, attributes: Attributes) -> Result<Uuid, StoreError> {
        self.ensure_open()?;

        let id = Uuid::new_v4();
        self.records
            .lock()
            .insert((collection.to_string(), id), strip_id(attributes));

        Ok(id)
    }

    async fn find(&self, collection: &str, id: Uuid) -> Result<Option<Record>, StoreError> {
        self.ensure_open()?;

        Ok(self
            .records
            .lock()
            .get(&(collection.to_string(), id))
            .map(|attributes| Record {
                id,
                attributes: attributes.clone(),
            }))
    }

    async fn update(
        &self,
        collection: &str,
        id: Uuid,
        attributes: Attributes,
    ) -> Result<bool, StoreError> {
        self.ensure_open()?;

        match self.records.lock().get_mut(&(collection.to_string(), id)) {
            Some(existing) => {
                existing.extend(strip_id(attributes));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<bool, StoreError> {
        self.ensure_open()?;

        Ok(self
            .records
            .lock()
            .remove(&(collection.to_string(), id))
            .is_some())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

use uuid::Uuid;

use crate::{
    database::{Attributes, DocumentStore, Record},
    error::AppError,
};

/// Generic CRUD over one collection. Identifiers are store-issued UUIDs; anything that does not
/// parse as one is rejected before it reaches the store.
pub struct Records<'a> {
    store: &'a dyn DocumentStore,
    collection: &'a str,
}

pub fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::InvalidIdentifier(raw.to_string()))
}

impl<'a> Records<'a> {
    pub fn new(store: &'a dyn DocumentStore, collection: &'a str) -> Self {
        Self { store, collection }
    }

    pub async fn create(&self, attributes: Attributes) -> Result<Uuid, AppError> {
        Ok(self.store.insert(self.collection, attributes).await?)
    }

    pub async fn read_by_id(&self, id: &str) -> Result<Record, AppError> {
        let id = parse_id(id)?;

        self.store
            .find(self.collection, id)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn update(&self, id: &str, attributes: Attributes) -> Result<bool, AppError> {
        let id = parse_id(id)?;

        Ok(self.store.update(self.collection, id, attributes).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<bool, AppError> {
        let id = parse_id(id)?;

        Ok(self.store.delete(self.collection, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn create_then_read() {
        let store = MemoryStore::new();
        let records = Records::new(&store, "records");
        let attributes = json!({ "name": "tacos" }).as_object().cloned().unwrap();

        let id = records.create(attributes.clone()).await.unwrap();
        let record = records.read_by_id(&id.to_string()).await.unwrap();

        assert_eq!(record.id, id);
        assert_eq!(record.attributes, attributes);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = MemoryStore::new();
        let records = Records::new(&store, "records");

        let err = records
            .read_by_id(&Uuid::new_v4().to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound));
    }

    #[tokio::test]
    async fn malformed_id_is_invalid_identifier() {
        let store = MemoryStore::new();
        let records = Records::new(&store, "records");

        let err = records.read_by_id("not-an-id").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier(raw) if raw == "not-an-id"));

        let err = records.delete("123").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn update_and_delete_report_matches() {
        let store = MemoryStore::new();
        let records = Records::new(&store, "records");
        let id = records.create(Attributes::new()).await.unwrap().to_string();
        let missing = Uuid::new_v4().to_string();

        assert!(records.update(&id, Attributes::new()).await.unwrap());
        assert!(!records.update(&missing, Attributes::new()).await.unwrap());

        assert!(records.delete(&id).await.unwrap());
        assert!(!records.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn store_failure_is_internal() {
        let store = MemoryStore::new();
        store.close().await;
        let records = Records::new(&store, "records");

        let err = records.create(Attributes::new()).await.unwrap_err();
        assert!(matches!(err, AppError::InternalError(_)));
    }
}

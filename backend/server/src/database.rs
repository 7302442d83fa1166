//! # Redis
//!
//! Document store behind the counter and the record routes.
//!
//! ## Implementation
//!
//! - Counter: hash `counter:{sentinel}` with one `count` field, bumped by `HINCRBY`. Redis
//!   creates the hash on first use, so the first increment returns 1 without a separate
//!   initialisation step.
//! - Records: hash `records:{collection}:{id}`, `_id` plus one JSON-encoded value per attribute.
//! - Updates go through a Lua script so "only if it exists" and the write happen in one step.
//! - One `ConnectionManager` per process, cloned per operation. Closing drops it; later
//!   operations fail with [`StoreError::Closed`].
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{error::StoreError, memory::MemoryStore};

pub type Attributes = Map<String, Value>;
pub type Store = Arc<dyn DocumentStore>;

pub const ID_FIELD: &str = "_id";
pub const COUNT_FIELD: &str = "count";

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

const UPDATE_IF_EXISTS: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if #ARGV > 0 then
    redis.call('HSET', KEYS[1], unpack(ARGV))
end
return 1
"#;

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub id: Uuid,
    pub attributes: Attributes,
}

/// Open session to the document store, shared by every request task.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Atomically add one to the sentinel's `count`, creating it at 1 if absent.
    async fn increment(&self, sentinel: &str) -> Result<u64, StoreError>;

    async fn insert(&self, collection: &str, attributes: Attributes) -> Result<Uuid, StoreError>;

    async fn find(&self, collection: &str, id: Uuid) -> Result<Option<Record>, StoreError>;

    async fn update(
        &self,
        collection: &str,
        id: Uuid,
        attributes: Attributes,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, collection: &str, id: Uuid) -> Result<bool, StoreError>;

    /// Release the session. Calling it again is a no-op.
    async fn close(&self);
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, connection_string: &str) -> Result<Store, StoreError>;
}

/// Picks the store by connection-string scheme.
pub struct Connector;

#[async_trait]
impl StoreConnector for Connector {
    async fn connect(&self, connection_string: &str) -> Result<Store, StoreError> {
        let connection_string = connection_string.trim();
        if connection_string.is_empty() {
            return Err(StoreError::InvalidConnectionString(
                "connection string is empty".to_string(),
            ));
        }

        match scheme(connection_string) {
            Some("redis" | "rediss" | "unix" | "redis+unix") => {
                info!("Connecting to redis ({})", redact(connection_string));
                Ok(Arc::new(RedisStore::connect(connection_string).await?))
            }
            Some("memory") => {
                warn!("Using in-process store, data will not outlive the process");
                Ok(Arc::new(MemoryStore::new()))
            }
            Some(other) => Err(StoreError::ConnectionFailed(format!(
                "unsupported scheme {other}"
            ))),
            None => Err(StoreError::InvalidConnectionString(
                "missing scheme".to_string(),
            )),
        }
    }
}

fn scheme(connection_string: &str) -> Option<&str> {
    connection_string
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
}

/// Scheme and host only, credentials stripped.
pub fn redact(connection_string: &str) -> String {
    match connection_string.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
            let host = host.split(['/', '?']).next().unwrap_or_default();
            format!("{scheme}://{host}")
        }
        None => "<invalid>".to_string(),
    }
}

pub fn counter_key(sentinel: &str) -> String {
    format!("counter:{sentinel}")
}

pub fn record_key(collection: &str, id: Uuid) -> String {
    format!("records:{collection}:{id}")
}

pub fn encode_fields(attributes: &Attributes) -> Result<Vec<(String, String)>, StoreError> {
    attributes
        .iter()
        .filter(|(name, _)| name.as_str() != ID_FIELD)
        .map(|(name, value)| {
            serde_json::to_string(value)
                .map(|encoded| (name.clone(), encoded))
                .map_err(|e| StoreError::Operation(e.to_string()))
        })
        .collect()
}

pub fn decode_fields<I>(key: &str, id: Uuid, fields: I) -> Result<Record, StoreError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut attributes = Attributes::new();

    for (name, encoded) in fields {
        if name == ID_FIELD {
            continue;
        }
        let value = serde_json::from_str(&encoded).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: format!("field {name}: {e}"),
        })?;
        attributes.insert(name, value);
    }

    Ok(Record { id, attributes })
}

pub struct RedisStore {
    connection: RwLock<Option<ConnectionManager>>,
    update_script: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(CONNECTION_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT);

        let client = Client::open(redis_url)
            .map_err(|e| StoreError::InvalidConnectionString(e.to_string()))?;

        let mut connection_manager = client
            .get_connection_manager_with_config(config)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<String>(&mut connection_manager)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            connection: RwLock::new(Some(connection_manager)),
            update_script: Script::new(UPDATE_IF_EXISTS),
        })
    }

    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        self.connection.read().clone().ok_or(StoreError::Closed)
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn increment(&self, sentinel: &str) -> Result<u64, StoreError> {
        let key = counter_key(sentinel);
        let count: i64 = self
            .connection()?
            .hincr(&key, COUNT_FIELD, 1)
            .await?;

        u64::try_from(count).map_err(|_| StoreError::Corrupt {
            key,
            reason: format!("negative count {count}"),
        })
    }

    async fn insert(&self, collection: &str, attributes: Attributes) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let mut fields = encode_fields(&attributes)?;
        fields.push((ID_FIELD.to_string(), id.to_string()));

        let () = self
            .connection()?
            .hset_multiple(record_key(collection, id), fields.as_slice())
            .await?;

        Ok(id)
    }

    async fn find(&self, collection: &str, id: Uuid) -> Result<Option<Record>, StoreError> {
        let key = record_key(collection, id);
        let fields: HashMap<String, String> = self.connection()?.hgetall(&key).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        decode_fields(&key, id, fields).map(Some)
    }

    async fn update(
        &self,
        collection: &str,
        id: Uuid,
        attributes: Attributes,
    ) -> Result<bool, StoreError> {
        let fields = encode_fields(&attributes)?;

        let mut invocation = self.update_script.key(record_key(collection, id));
        for (name, value) in &fields {
            invocation.arg(name).arg(value);
        }

        let matched: i64 = invocation.invoke_async(&mut self.connection()?).await?;

        Ok(matched == 1)
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<bool, StoreError> {
        let removed: i64 = self.connection()?.del(record_key(collection, id)).await?;

        Ok(removed > 0)
    }

    async fn close(&self) {
        if self.connection.write().take().is_some() {
            info!("Redis connection closed");
        }
    }
}

use tracing::error;

use crate::{database::DocumentStore, error::AppError};

/// One store-side `increment`. Never retried, never read-then-written, never cached.
pub async fn increment_and_get(store: &dyn DocumentStore, sentinel: &str) -> Result<u64, AppError> {
    store.increment(sentinel).await.map_err(|e| {
        error!("Error incrementing visit count for {sentinel}: {e}");
        AppError::CounterUpdateFailed(e)
    })
}

use std::sync::Arc;

use super::{bootstrap::Bootstrap, config::Config, database::Store, error::AppError};

pub struct State {
    pub config: Config,
    pub bootstrap: Bootstrap,
}

impl State {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            bootstrap: Bootstrap::new(),
        })
    }

    pub fn store(&self) -> Result<&Store, AppError> {
        self.bootstrap.store().ok_or(AppError::ServiceUnavailable)
    }
}

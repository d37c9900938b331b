//! Policy store implementations

use super::{PolicyStore, StoreError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;

/// Fixed set of application ids
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyStore {
    app_ids: HashSet<String>,
}

impl StaticPolicyStore {
    pub fn new<I, S>(app_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            app_ids: app_ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn get_app_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.app_ids.clone())
    }
}

/// Application ids read from a JSON array file on every call
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicyStore for FilePolicyStore {
    async fn get_app_ids(&self) -> Result<HashSet<String>, StoreError> {
        let data = tokio::fs::read(&self.path).await?;
        let ids: Vec<String> = serde_json::from_slice(&data)?;
        Ok(ids.into_iter().collect())
    }
}

//! Secret lookup abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{Error, Result};

/// A secret value (can be a single string or key-value pairs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    /// A single secret string.
    String(String),
    /// A map of key-value pairs.
    Map(HashMap<String, String>),
}

impl SecretValue {
    /// Get the value as a string (returns first/only value for maps).
    pub fn as_string(&self) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s),
            SecretValue::Map(m) => m.values().next().map(|s| s.as_str()),
        }
    }
}

/// Trait for the secrets vault.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve a named secret for a project and job kind.
    async fn resolve(&self, project_id: i64, name: &str, job_kind: &str) -> Result<SecretValue>;
}

/// In-process secret table for development and tests.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<(i64, String, String), SecretValue>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, project_id: i64, name: &str, job_kind: &str, value: SecretValue) {
        self.secrets
            .write()
            .await
            .insert((project_id, name.to_string(), job_kind.to_string()), value);
    }
}

#[async_trait]
impl SecretResolver for MemorySecretStore {
    async fn resolve(&self, project_id: i64, name: &str, job_kind: &str) -> Result<SecretValue> {
        self.secrets
            .read()
            .await
            .get(&(project_id, name.to_string(), job_kind.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "secret {name} for project {project_id} ({job_kind})"
                ))
            })
    }
}

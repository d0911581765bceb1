//! Artifact storage abstraction.
//!
//! The scheduler never interprets artifact contents. It only hands workers
//! credentials scoped to their job.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::id::JobKey;
use crate::{Error, Result};

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Storage key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// When the artifact was stored.
    pub created_at: DateTime<Utc>,
}

/// Credentials a worker uses to talk to the artifact store for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCredentials {
    pub endpoint: String,
    /// Key prefix the worker may write under.
    pub prefix: String,
    pub token: String,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact.
    async fn put(&self, key: &str, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact.
    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes>;

    /// Credentials handed to the worker in the dispatch message.
    async fn credentials(&self, job: &JobKey) -> Result<ArtifactCredentials>;
}

/// In-process artifact store for development and tests.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<ArtifactRef> {
        let size = data.len() as u64;
        self.objects.write().await.insert(key.to_string(), data);
        Ok(ArtifactRef {
            key: key.to_string(),
            size,
            created_at: Utc::now(),
        })
    }

    async fn get(&self, reference: &ArtifactRef) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(&reference.key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("artifact {}", reference.key)))
    }

    async fn credentials(&self, job: &JobKey) -> Result<ArtifactCredentials> {
        Ok(ArtifactCredentials {
            endpoint: "memory://".to_string(),
            prefix: format!("jobs/{job}/"),
            token: String::new(),
        })
    }
}

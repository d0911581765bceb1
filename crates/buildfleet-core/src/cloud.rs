//! Cloud provisioning collaborator for controlled workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::worker::InstanceSpec;

/// State of a cloud instance as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Ready { address: String },
    Stopped,
    Failed { message: String },
}

/// Trait for cloud backends that create and destroy worker instances.
///
/// Readiness is observed by polling `describe`. Callers bound every call
/// with a timeout, so implementations need not.
#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Request a new instance. Returns the provider's instance handle.
    async fn create(&self, spec: &InstanceSpec) -> Result<String>;

    async fn describe(&self, handle: &str) -> Result<InstanceState>;

    /// Start a stopped instance.
    async fn start(&self, handle: &str) -> Result<()>;

    /// Stop a running instance without destroying it.
    async fn stop(&self, handle: &str) -> Result<()>;

    async fn destroy(&self, handle: &str) -> Result<()>;
}

/// Provisioner used when no cloud backend is configured.
pub struct DisabledProvisioner;

#[async_trait]
impl CloudProvisioner for DisabledProvisioner {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn create(&self, _spec: &InstanceSpec) -> Result<String> {
        Err(crate::Error::Unsupported(
            "no cloud provisioner configured".to_string(),
        ))
    }

    async fn describe(&self, handle: &str) -> Result<InstanceState> {
        Ok(InstanceState::Failed {
            message: format!("no cloud provisioner configured for {handle}"),
        })
    }

    async fn start(&self, _handle: &str) -> Result<()> {
        Err(crate::Error::Unsupported(
            "no cloud provisioner configured".to_string(),
        ))
    }

    async fn stop(&self, _handle: &str) -> Result<()> {
        Err(crate::Error::Unsupported(
            "no cloud provisioner configured".to_string(),
        ))
    }

    async fn destroy(&self, _handle: &str) -> Result<()> {
        Err(crate::Error::Unsupported(
            "no cloud provisioner configured".to_string(),
        ))
    }
}

//! System configuration parsing.
//!
//! ```kdl
//! server listen="0.0.0.0:3000" public-url="http://ci.internal:3000"
//! database url="postgres://buildfleet@127.0.0.1/buildfleet"
//!
//! scheduler {
//!     interval-secs 5
//!     max-controlled-workers 4
//!     priority-order "lower-first"
//! }
//!
//! instance {
//!     source-image "ci-base-2024"
//!     instance-class "c6i.xlarge"
//!     volume-gb 100
//!     priority 1
//! }
//!
//! external-worker "mac-mini" address="http://10.0.0.5:7000" priority=5 ssh-key="keys/mac"
//! ```
//!
//! Every setting has a default; an empty document is a valid configuration.

use buildfleet_core::worker::{ExternalWorkerSpec, InstanceSpec};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::kdl_util::{
    get_first_string_arg, get_int_prop, get_string_prop, require_float_arg, require_int_arg,
    require_string_arg, require_u64_arg,
};
use crate::{ConfigError, ConfigResult};

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Address the HTTP server binds to.
    pub listen: String,
    /// Base URL workers use to reach the output ingestion channel.
    pub public_url: String,
    /// PostgreSQL URL. Without one the in-memory store is used.
    pub database_url: Option<String>,
    pub scheduler: SchedulerSettings,
    pub pool: PoolSettings,
    pub output: OutputSettings,
    pub maintenance: MaintenanceSettings,
    /// What a newly provisioned controlled worker looks like.
    pub instance: InstanceSpec,
    pub external_workers: Vec<ExternalWorkerSpec>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            public_url: "http://localhost:3000".to_string(),
            database_url: None,
            scheduler: SchedulerSettings::default(),
            pool: PoolSettings::default(),
            output: OutputSettings::default(),
            maintenance: MaintenanceSettings::default(),
            instance: InstanceSpec {
                source_image: "buildfleet-worker".to_string(),
                instance_class: "standard".to_string(),
                volume_gb: 50,
                priority: 1,
            },
            external_workers: Vec::new(),
        }
    }
}

/// Which end of the priority scale is preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityOrder {
    LowerFirst,
    HigherFirst,
}

impl PriorityOrder {
    /// Sort key so that preferred workers come first in ascending order.
    pub fn rank(&self, priority: i32) -> i64 {
        match self {
            PriorityOrder::LowerFirst => priority as i64,
            PriorityOrder::HigherFirst => -(priority as i64),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Time between scheduling passes.
    pub interval: Duration,
    /// Ceiling on non-terminated controlled workers.
    pub max_controlled_workers: usize,
    /// Candidates tried per job per pass before leaving it queued.
    pub reserve_attempts: usize,
    pub dispatch_timeout: Duration,
    /// Rollbacks before a job is force-failed as an infrastructure error.
    pub max_dispatch_attempts: i32,
    pub cancel_grace: Duration,
    pub priority_order: PriorityOrder,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_controlled_workers: 0,
            reserve_attempts: 3,
            dispatch_timeout: Duration::from_secs(30),
            max_dispatch_attempts: 3,
            cancel_grace: Duration::from_secs(30),
            priority_order: PriorityOrder::LowerFirst,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub health_interval: Duration,
    pub probe_timeout: Duration,
    /// How long a worker may go unseen before it is marked unreachable.
    pub unreachable_after: Duration,
    pub provision_poll_interval: Duration,
    pub provision_timeout: Duration,
    /// Upper bound on any single cloud provider call.
    pub cloud_timeout: Duration,
    /// After a provisioning failure, no new controlled worker is requested
    /// for this long.
    pub provision_backoff: Duration,
    /// Disk usage fraction above which controlled workers are queued for cleanup.
    pub disk_cleanup_threshold: f64,
    /// Jobs a worker runs before it asks for maintenance. Zero disables.
    pub maintenance_every_jobs: i32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            unreachable_after: Duration::from_secs(120),
            provision_poll_interval: Duration::from_secs(15),
            provision_timeout: Duration::from_secs(600),
            cloud_timeout: Duration::from_secs(60),
            provision_backoff: Duration::from_secs(300),
            disk_cleanup_threshold: 0.85,
            maintenance_every_jobs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Section text of jobs finished longer ago than this is purged.
    pub retention: Duration,
    pub purge_interval: Duration,
    /// Per-section cap on stored output.
    pub max_section_bytes: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 3600),
            purge_interval: Duration::from_secs(3600),
            max_section_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    pub interval: Duration,
    pub action_timeout: Duration,
    /// Stop controlled workers idle for this long. `None` disables.
    pub idle_stop_after: Option<Duration>,
    /// Tear down controlled workers stopped for this long. `None` disables.
    pub idle_teardown_after: Option<Duration>,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            action_timeout: Duration::from_secs(300),
            idle_stop_after: Some(Duration::from_secs(1800)),
            idle_teardown_after: Some(Duration::from_secs(6 * 3600)),
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_system_config(&text)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(listen) = get_string_prop(node, "listen") {
                    config.listen = listen;
                }
                if let Some(url) = get_string_prop(node, "public-url") {
                    config.public_url = url;
                }
            }
            "database" => {
                config.database_url = get_string_prop(node, "url")
                    .or_else(|| get_first_string_arg(node))
                    .filter(|u| !u.is_empty());
            }
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "pool" => parse_pool(node, &mut config.pool)?,
            "output" => parse_output(node, &mut config.output)?,
            "maintenance" => parse_maintenance(node, &mut config.maintenance)?,
            "instance" => parse_instance(node, &mut config.instance)?,
            "external-worker" => {
                let worker = parse_external_worker(node)?;
                if config
                    .external_workers
                    .iter()
                    .any(|w| w.name == worker.name)
                {
                    return Err(ConfigError::Duplicate(format!(
                        "external-worker '{}'",
                        worker.name
                    )));
                }
                config.external_workers.push(worker);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes().iter())
}

fn unknown(section: &str, name: &str) -> ConfigError {
    ConfigError::UnknownSetting {
        section: section.to_string(),
        name: name.to_string(),
    }
}

fn secs(node: &KdlNode) -> ConfigResult<Duration> {
    Ok(Duration::from_secs(require_u64_arg(node)?))
}

fn optional_secs(node: &KdlNode) -> ConfigResult<Option<Duration>> {
    let value = require_u64_arg(node)?;
    Ok((value > 0).then(|| Duration::from_secs(value)))
}

fn positive(node: &KdlNode) -> ConfigResult<u64> {
    let value = require_u64_arg(node)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: node.name().value().to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_scheduler(node: &KdlNode, s: &mut SchedulerSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "interval-secs" => s.interval = secs(child)?,
            "max-controlled-workers" => {
                s.max_controlled_workers = require_u64_arg(child)? as usize;
            }
            "reserve-attempts" => s.reserve_attempts = positive(child)? as usize,
            "dispatch-timeout-secs" => s.dispatch_timeout = secs(child)?,
            "max-dispatch-attempts" => s.max_dispatch_attempts = positive(child)? as i32,
            "cancel-grace-secs" => s.cancel_grace = secs(child)?,
            "priority-order" => {
                s.priority_order = match require_string_arg(child)?.as_str() {
                    "lower-first" | "ascending" => PriorityOrder::LowerFirst,
                    "higher-first" | "descending" => PriorityOrder::HigherFirst,
                    other => {
                        return Err(ConfigError::InvalidValue {
                            field: "priority-order".to_string(),
                            message: format!("unknown priority order: {}", other),
                        });
                    }
                }
            }
            other => return Err(unknown("scheduler", other)),
        }
    }
    Ok(())
}

fn parse_pool(node: &KdlNode, p: &mut PoolSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "health-interval-secs" => p.health_interval = secs(child)?,
            "probe-timeout-secs" => p.probe_timeout = secs(child)?,
            "unreachable-after-secs" => p.unreachable_after = secs(child)?,
            "provision-poll-secs" => p.provision_poll_interval = secs(child)?,
            "provision-timeout-secs" => p.provision_timeout = secs(child)?,
            "cloud-timeout-secs" => p.cloud_timeout = Duration::from_secs(positive(child)?),
            "provision-backoff-secs" => p.provision_backoff = secs(child)?,
            "disk-cleanup-threshold" => {
                let value = require_float_arg(child)?;
                if !(value > 0.0 && value <= 1.0) {
                    return Err(ConfigError::InvalidValue {
                        field: "disk-cleanup-threshold".to_string(),
                        message: format!("expected a fraction in (0, 1], got {}", value),
                    });
                }
                p.disk_cleanup_threshold = value;
            }
            "maintenance-every-jobs" => {
                p.maintenance_every_jobs = require_u64_arg(child)? as i32;
            }
            other => return Err(unknown("pool", other)),
        }
    }
    Ok(())
}

fn parse_output(node: &KdlNode, o: &mut OutputSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "retention-days" => {
                o.retention = Duration::from_secs(require_u64_arg(child)? * 24 * 3600);
            }
            "purge-interval-secs" => o.purge_interval = secs(child)?,
            "max-section-bytes" => o.max_section_bytes = positive(child)? as usize,
            other => return Err(unknown("output", other)),
        }
    }
    Ok(())
}

fn parse_maintenance(node: &KdlNode, m: &mut MaintenanceSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "interval-secs" => m.interval = secs(child)?,
            "action-timeout-secs" => m.action_timeout = secs(child)?,
            "idle-stop-after-secs" => m.idle_stop_after = optional_secs(child)?,
            "idle-teardown-after-secs" => m.idle_teardown_after = optional_secs(child)?,
            other => return Err(unknown("maintenance", other)),
        }
    }
    Ok(())
}

fn parse_instance(node: &KdlNode, spec: &mut InstanceSpec) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "source-image" => spec.source_image = require_string_arg(child)?,
            "instance-class" => spec.instance_class = require_string_arg(child)?,
            "volume-gb" => spec.volume_gb = positive(child)? as i32,
            "priority" => spec.priority = require_int_arg(child)? as i32,
            other => return Err(unknown("instance", other)),
        }
    }
    Ok(())
}

fn parse_external_worker(node: &KdlNode) -> ConfigResult<ExternalWorkerSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("external-worker name".to_string()))?;
    let address = get_string_prop(node, "address").ok_or_else(|| {
        ConfigError::MissingField(format!("address for external-worker '{}'", name))
    })?;
    let priority = get_int_prop(node, "priority")?.unwrap_or(10) as i32;
    let ssh_key_ref = get_string_prop(node, "ssh-key");

    Ok(ExternalWorkerSpec {
        name,
        address,
        priority,
        ssh_key_ref,
    })
}

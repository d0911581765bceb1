//! KDL configuration parsing for BuildFleet.
//!
//! This crate handles parsing of the system configuration (`buildfleet.kdl`):
//! server and database settings, scheduler/pool/output/maintenance tuning,
//! the default controlled instance and statically registered external workers.

pub mod error;
mod kdl_util;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    MaintenanceSettings, OutputSettings, PoolSettings, PriorityOrder, SchedulerSettings,
    SystemConfig, load_system_config, parse_system_config,
};

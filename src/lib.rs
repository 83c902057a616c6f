//! Zabbix to Cachet status bridge
//!
//! Mirrors the Zabbix IT service tree as Cachet components and component
//! groups, and turns active Zabbix problems into Cachet incidents that follow
//! the problem through acknowledgement and resolution.

pub mod bridge;
pub mod component;
pub mod config;
pub mod errors;
pub mod incident;
pub mod model;
pub mod monitoring;
pub mod state;
pub mod statuspage;
pub mod template;
pub mod transport;

pub use bridge::StatusBridge;
pub use component::{ComponentReconciler, SyncReport};
pub use config::Config;
pub use errors::{BridgeError, Result};
pub use incident::{CycleReport, IncidentReconciler, IncidentSync};
pub use monitoring::{MonitoringClient, ZabbixClient};
pub use state::{ComponentMap, IncidentStore, SharedComponentMap};
pub use statuspage::{CachetClient, StatusPageClient};
pub use template::Templates;

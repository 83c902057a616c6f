//! Bridge runtime: startup sequence and the two periodic reconciliation tasks

use crate::component::ComponentReconciler;
use crate::config::Config;
use crate::errors::{BridgeError, Result};
use crate::incident::{IncidentReconciler, IncidentSync};
use crate::monitoring::{MonitoringClient, ZabbixClient};
use crate::state::{ComponentMap, SharedComponentMap};
use crate::statuspage::{CachetClient, StatusPageClient};
use crate::template::Templates;
use crate::transport::{HttpTransport, TransportOptions};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Wires the monitoring and status page clients to the reconcilers and runs them
pub struct StatusBridge {
    config: Config,
    monitoring: Arc<dyn MonitoringClient>,
    status_page: Arc<dyn StatusPageClient>,
    incidents: Arc<IncidentReconciler>,
    components: Arc<ComponentReconciler>,
    component_map: SharedComponentMap,
    transports: Vec<(&'static str, HttpTransport)>,
    bridge_id: String,
}

impl StatusBridge {
    /// Build the bridge against the configured Zabbix and Cachet servers
    pub async fn new(config: Config, templates: Templates) -> Result<Self> {
        config.validate().map_err(BridgeError::Config)?;

        let zabbix = Arc::new(ZabbixClient::new(
            &config.zabbix,
            transport_options(&config, config.zabbix.https_verify),
        )?);
        if let Err(e) = zabbix.login().await {
            warn!("Zabbix login failed, will retry on first request: {}", e);
        }

        let cachet = Arc::new(
            CachetClient::new(&config.cachet, transport_options(&config, config.cachet.https_verify)).await?,
        );

        let transports = vec![
            ("zabbix", zabbix.transport().clone()),
            ("cachet", cachet.transport().clone()),
        ];

        let mut bridge = Self::with_clients(config, templates, zabbix, cachet);
        bridge.transports = transports;
        Ok(bridge)
    }

    /// Build the bridge over arbitrary clients
    pub fn with_clients(
        config: Config,
        templates: Templates,
        monitoring: Arc<dyn MonitoringClient>,
        status_page: Arc<dyn StatusPageClient>,
    ) -> Self {
        let incidents = Arc::new(IncidentReconciler::new(
            Arc::clone(&monitoring),
            Arc::clone(&status_page),
            templates,
        ));
        let components = Arc::new(ComponentReconciler::new(
            Arc::clone(&monitoring),
            Arc::clone(&status_page),
            config.settings.root_service().map(str::to_string),
        ));

        Self {
            config,
            monitoring,
            status_page,
            incidents,
            components,
            component_map: ComponentMap::new().shared(),
            transports: Vec::new(),
            bridge_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn component_map(&self) -> SharedComponentMap {
        Arc::clone(&self.component_map)
    }

    /// Run until Ctrl-C
    #[instrument(skip(self), fields(bridge_id = %self.bridge_id))]
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting bridge {} (incidents every {}s, components every {}s)",
            self.bridge_id, self.config.settings.update_inc_interval, self.config.settings.update_comp_interval
        );

        let sync = self.prepare().await;
        let tasks = self.spawn_tasks(sync);

        let signal = tokio::signal::ctrl_c().await;
        for task in &tasks {
            task.abort();
        }
        signal?;

        info!("Shutting down bridge");
        self.shutdown().await;
        Ok(())
    }

    /// Connectivity check, first component pass and incident recovery
    pub async fn prepare(&self) -> IncidentSync {
        self.check_connectivity().await;

        if let Err(e) = self.components.run_cycle(&self.component_map).await {
            error!("Initial component sync failed: {}", e);
        }

        let mut sync = IncidentSync::new(Arc::clone(&self.incidents));
        if let Err(e) = sync.recover().await {
            error!("Incident recovery failed, incident cycles wait until it succeeds: {}", e);
        }
        sync
    }

    /// Log both remote versions; failures are not fatal
    pub async fn check_connectivity(&self) -> bool {
        let (zabbix, cachet) = futures::join!(self.monitoring.version(), self.status_page.version());

        let mut ok = true;
        match zabbix {
            Ok(version) => info!("Zabbix version: {}", version),
            Err(e) => {
                warn!("Zabbix connectivity test failed, but continuing anyway: {}", e);
                ok = false;
            }
        }
        match cachet {
            Ok(version) => info!("Cachet version: {}", version),
            Err(e) => {
                warn!("Cachet connectivity test failed, but continuing anyway: {}", e);
                ok = false;
            }
        }
        ok
    }

    fn spawn_tasks(&self, mut sync: IncidentSync) -> Vec<JoinHandle<()>> {
        let components = Arc::clone(&self.components);
        let map = Arc::clone(&self.component_map);
        let every = self.config.settings.update_comp_interval();
        let component_task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires at once and startup already ran a pass
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = components.run_cycle(&map).await {
                    error!("Component sync failed: {}", e);
                }
            }
        });

        let map = Arc::clone(&self.component_map);
        let every = self.config.settings.update_inc_interval();
        let incident_task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sync.tick(&map).await {
                    error!("Incident sync failed: {}", e);
                }
            }
        });

        let transports = self.transports.clone();
        let metrics_task = tokio::spawn(async move {
            report_metrics(transports).await;
        });

        vec![component_task, incident_task, metrics_task]
    }

    async fn shutdown(&self) {
        for (name, transport) in &self.transports {
            let metrics = transport.metrics().await;
            info!(
                "Final {} transport metrics - Success rate: {:.1}%, Total attempts: {}, Avg duration: {}ms",
                name, metrics.success_rate, metrics.attempts, metrics.avg_duration_ms
            );
        }
        info!("Bridge {} shutdown complete", self.bridge_id);
    }
}

fn transport_options(config: &Config, verify_tls: bool) -> TransportOptions {
    TransportOptions {
        timeout: config.settings.http_timeout(),
        max_retries: config.settings.max_retries,
        retry_backoff_ms: config.settings.retry_backoff_ms,
        verify_tls,
    }
}

async fn report_metrics(transports: Vec<(&'static str, HttpTransport)>) {
    let mut ticker = interval(Duration::from_secs(300));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        for (name, transport) in &transports {
            let metrics = transport.metrics().await;
            info!(
                "{} transport metrics - {:.1}% success rate, {} attempts, {} failures, {}ms avg",
                name, metrics.success_rate, metrics.attempts, metrics.failures, metrics.avg_duration_ms
            );
        }
    }
}

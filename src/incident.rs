//! Incident reconciliation: mirrors active problems as status page incidents

use crate::errors::{BridgeError, Result};
use crate::model::{ComponentId, ComponentStatus, IncidentState, NewIncident, Problem};
use crate::monitoring::MonitoringClient;
use crate::state::{ComponentMap, IncidentStore, MappedComponent, SharedComponentMap, TrackedIncident};
use crate::statuspage::StatusPageClient;
use crate::template::Templates;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What one incident cycle changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: usize,
    pub acknowledged: usize,
    /// Further acknowledgements appended to an already acknowledged incident
    pub updated: usize,
    pub resolved: usize,
    /// Problems skipped because none of their services has a component yet
    pub deferred: usize,
    pub failed: usize,
    pub component_updates: usize,
}

impl CycleReport {
    /// Number of writes made to the status page
    pub fn total(&self) -> usize {
        self.created + self.acknowledged + self.updated + self.resolved + self.component_updates
    }
}

pub struct IncidentReconciler {
    monitoring: Arc<dyn MonitoringClient>,
    status_page: Arc<dyn StatusPageClient>,
    templates: Templates,
}

impl IncidentReconciler {
    pub fn new(
        monitoring: Arc<dyn MonitoringClient>,
        status_page: Arc<dyn StatusPageClient>,
        templates: Templates,
    ) -> Self {
        Self {
            monitoring,
            status_page,
            templates,
        }
    }

    /// Rebuild the store from incidents this bridge left open on the status page
    #[instrument(skip_all)]
    pub async fn recover(&self, store: &mut IncidentStore) -> Result<usize> {
        let remote = self.status_page.list_incidents().await?;
        let components = self.status_page.list_components().await?;

        let dropped = store.retain_remote(&remote);
        if !dropped.is_empty() {
            info!("Forgetting {} problems resolved outside the bridge: {:?}", dropped.len(), dropped);
        }

        // Severity is not stored remotely; the shown status stands in until the problem is seen again
        let shown: HashMap<&str, ComponentStatus> = components
            .iter()
            .map(|component| (component.id.as_str(), component.status))
            .collect();
        let loaded = store.load_remote(&remote, |incident| {
            incident
                .component_ids
                .iter()
                .filter_map(|id| shown.get(id.as_str()).copied())
                .max()
                .filter(|status| *status != ComponentStatus::Operational)
                .unwrap_or(ComponentStatus::PerformanceIssues)
        });

        store.seed_published(components.iter().map(|c| (c.id.clone(), c.status)));
        info!("Recovered {} open incidents from the status page", loaded);
        Ok(loaded)
    }

    /// One reconciliation pass. A failed problem fetch aborts with the store untouched.
    #[instrument(skip_all, fields(cycle_id = %uuid::Uuid::new_v4()))]
    pub async fn run_cycle(&self, store: &mut IncidentStore, map: &SharedComponentMap) -> Result<CycleReport> {
        let mut problems = self.monitoring.list_active_problems().await?;
        problems.sort_by(|a, b| a.id.cmp(&b.id));

        match self.status_page.list_components().await {
            Ok(components) => store.refresh_published(components.into_iter().map(|c| (c.id, c.status))),
            Err(e) => warn!("Could not read component statuses, using the last known ones: {}", e),
        }

        let snapshot = map.read().await.clone();
        debug!("{} active problems, {} tracked incidents", problems.len(), store.len());

        let mut report = CycleReport::default();

        for problem in &problems {
            if problem.service_ids.is_empty() {
                debug!("Problem {} ({}) is not linked to any service", problem.id, problem.trigger_name);
                continue;
            }
            if !store.contains(&problem.id) {
                self.open_incident(problem, &snapshot, store, &mut report).await;
            }
        }

        for problem in &problems {
            self.acknowledge(problem, &snapshot, store, &mut report).await;
        }

        let active: HashSet<&str> = problems.iter().map(|p| p.id.as_str()).collect();
        let mut released = BTreeSet::new();
        for problem_id in store.problem_ids() {
            if !active.contains(problem_id.as_str()) {
                self.resolve(&problem_id, store, &mut report, &mut released).await;
            }
        }

        let mut targets = snapshot.component_ids();
        targets.extend(store.linked_components());
        targets.extend(released);
        for component_id in targets {
            self.publish_status(&component_id, store, &mut report).await;
        }

        if report.total() > 0 || report.failed > 0 {
            info!(
                "Incident cycle - created: {}, acknowledged: {}, updated: {}, resolved: {}, components: {}, deferred: {}, failed: {}",
                report.created,
                report.acknowledged,
                report.updated,
                report.resolved,
                report.component_updates,
                report.deferred,
                report.failed
            );
        }
        Ok(report)
    }

    async fn open_incident(
        &self,
        problem: &Problem,
        map: &ComponentMap,
        store: &mut IncidentStore,
        report: &mut CycleReport,
    ) {
        let components = map.resolve(&problem.service_ids);
        if components.is_empty() {
            let err = BridgeError::UnmappedService(problem.service_ids.clone());
            warn!("Deferring problem {} ({}): {}", problem.id, problem.trigger_name, err);
            report.deferred += 1;
            return;
        }

        let incident = self.new_incident(problem, &components);
        match self.status_page.create_incident(&incident).await {
            Ok(incident_id) => {
                let tracked = TrackedIncident::new(
                    incident_id,
                    problem.id.clone(),
                    incident.component_ids,
                    problem.severity.component_status(),
                );
                if store.insert(tracked) {
                    report.created += 1;
                }
            }
            Err(e) => {
                error!("Failed to create incident for problem {}: {}", problem.id, e);
                report.failed += 1;
            }
        }
    }

    fn new_incident(&self, problem: &Problem, components: &[&MappedComponent]) -> NewIncident {
        let group = components
            .iter()
            .find_map(|c| c.group_name.as_deref())
            .unwrap_or_default();
        let component = components
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let mut message = self.templates.investigating(
            group,
            &component,
            problem.created_at,
            &problem.trigger_name,
            &problem.trigger_description,
        );
        if message.trim().is_empty() {
            message = if problem.trigger_description.trim().is_empty() {
                problem.trigger_name.clone()
            } else {
                problem.trigger_description.clone()
            };
        }

        let name = if group.is_empty() {
            problem.trigger_name.clone()
        } else {
            format!("{} | {}", group, problem.trigger_name)
        };

        NewIncident {
            problem_id: problem.id.clone(),
            name,
            message,
            state: IncidentState::Investigating,
            component_ids: components.iter().map(|c| c.component_id.clone()).collect(),
        }
    }

    /// Append acknowledgements not yet posted, oldest first
    async fn acknowledge(
        &self,
        problem: &Problem,
        map: &ComponentMap,
        store: &mut IncidentStore,
        report: &mut CycleReport,
    ) {
        let Some(tracked) = store.get_mut(&problem.id) else {
            return;
        };
        // Recovered entries guess the status and know one component until the problem is seen again
        tracked.status = problem.severity.component_status();
        let linked = map
            .resolve(&problem.service_ids)
            .into_iter()
            .map(|c| c.component_id.clone())
            .collect();
        if tracked.relink(linked) {
            debug!("Incident {} now covers components {:?}", tracked.incident_id, tracked.component_ids);
        }

        // Unacknowledged events can still carry plain comments
        if !problem.acknowledged {
            return;
        }

        let incident_id = tracked.incident_id.clone();
        let pending: Vec<_> = problem
            .pending_acknowledgements(tracked.last_ack_at, &tracked.posted_acks)
            .into_iter()
            .cloned()
            .collect();

        for ack in pending {
            let text = self.templates.acknowledgement(&ack.message, ack.time, &ack.author);
            if let Err(e) = self
                .status_page
                .append_incident_update(&incident_id, IncidentState::Acknowledged, &text)
                .await
            {
                error!("Failed to acknowledge incident {} for problem {}: {}", incident_id, problem.id, e);
                report.failed += 1;
                return;
            }

            let Some(tracked) = store.get_mut(&problem.id) else {
                return;
            };
            tracked.record_ack(ack.key(), ack.time);
            if tracked.state == IncidentState::Investigating {
                tracked.advance(IncidentState::Acknowledged);
                report.acknowledged += 1;
                info!("Incident {} acknowledged by {}", incident_id, ack.author);
            } else {
                report.updated += 1;
            }
        }
    }

    async fn resolve(
        &self,
        problem_id: &str,
        store: &mut IncidentStore,
        report: &mut CycleReport,
        released: &mut BTreeSet<ComponentId>,
    ) {
        let Some(incident_id) = store.get(problem_id).map(|t| t.incident_id.clone()) else {
            return;
        };

        let text = self.templates.resolving(Utc::now());
        match self
            .status_page
            .append_incident_update(&incident_id, IncidentState::Resolved, &text)
            .await
        {
            Ok(()) => {
                if let Some(mut tracked) = store.remove(problem_id) {
                    tracked.advance(IncidentState::Resolved);
                    released.extend(tracked.component_ids);
                }
                report.resolved += 1;
                info!("Incident {} resolved (problem {})", incident_id, problem_id);
            }
            Err(e) => {
                error!("Failed to resolve incident {} for problem {}: {}", incident_id, problem_id, e);
                report.failed += 1;
            }
        }
    }

    async fn publish_status(&self, component_id: &str, store: &mut IncidentStore, report: &mut CycleReport) {
        let desired = store.desired_status(component_id);
        if store.published_status(component_id) == Some(desired) {
            return;
        }

        match self.status_page.set_component_status(component_id, desired).await {
            Ok(()) => {
                store.mark_published(component_id, desired);
                report.component_updates += 1;
            }
            Err(e) => {
                error!("Failed to set component {} to {}: {}", component_id, desired, e);
                report.failed += 1;
            }
        }
    }
}

/// Incident side of the bridge: the store plus the recovery it depends on.
///
/// Until recovery has succeeded once, every tick retries it and skips the cycle, so
/// incidents left open by a previous run are never created a second time.
pub struct IncidentSync {
    reconciler: Arc<IncidentReconciler>,
    store: IncidentStore,
    recovered: bool,
}

impl IncidentSync {
    pub fn new(reconciler: Arc<IncidentReconciler>) -> Self {
        Self {
            reconciler,
            store: IncidentStore::new(),
            recovered: false,
        }
    }

    pub async fn recover(&mut self) -> Result<usize> {
        let loaded = self.reconciler.recover(&mut self.store).await?;
        self.recovered = true;
        Ok(loaded)
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    pub fn store(&self) -> &IncidentStore {
        &self.store
    }

    /// Recover if still needed, then run one incident cycle
    pub async fn tick(&mut self, map: &SharedComponentMap) -> Result<CycleReport> {
        if !self.recovered {
            self.recover().await?;
        }
        self.reconciler.run_cycle(&mut self.store, map).await
    }
}

//! In-memory caches over remote truth: the incident state store and the component map

use crate::model::{
    ComponentGroup, ComponentId, ComponentStatus, GroupId, IncidentId, IncidentState, ProblemId,
    RemoteIncident, ServiceId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Local mirror of one problem's incident on the status page
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedIncident {
    pub incident_id: IncidentId,
    pub problem_id: ProblemId,
    pub component_ids: Vec<ComponentId>,
    pub state: IncidentState,
    /// Status this incident imposes on its components while open
    pub status: ComponentStatus,
    /// Time of the newest acknowledgement already posted
    pub last_ack_at: Option<DateTime<Utc>>,
    /// Keys of acknowledgements posted at `last_ack_at` or later
    pub posted_acks: HashSet<String>,
}

impl TrackedIncident {
    pub fn new(
        incident_id: IncidentId,
        problem_id: ProblemId,
        component_ids: Vec<ComponentId>,
        status: ComponentStatus,
    ) -> Self {
        Self {
            incident_id,
            problem_id,
            component_ids,
            state: IncidentState::Investigating,
            status,
            last_ack_at: None,
            posted_acks: HashSet::new(),
        }
    }

    /// Remember a posted acknowledgement; keys older than the newest second are dropped
    pub fn record_ack(&mut self, key: String, time: DateTime<Utc>) {
        if self.last_ack_at.is_none_or(|seen| time > seen) {
            self.last_ack_at = Some(time);
            self.posted_acks.clear();
        }
        self.posted_acks.insert(key);
    }

    /// Point the incident at the components its services map to now.
    ///
    /// The status page keeps a single component per incident, so recovered entries
    /// only know the first one until the problem is seen again.
    pub fn relink(&mut self, component_ids: Vec<ComponentId>) -> bool {
        if component_ids.is_empty() || component_ids == self.component_ids {
            return false;
        }
        self.component_ids = component_ids;
        true
    }

    /// Move the lifecycle forward; returns false (and changes nothing) for a backward move
    pub fn advance(&mut self, to: IncidentState) -> bool {
        if to < self.state {
            return false;
        }
        self.state = to;
        true
    }

    pub fn is_open(&self) -> bool {
        self.state != IncidentState::Resolved
    }

    pub fn links(&self, component_id: &str) -> bool {
        self.component_ids.iter().any(|id| id == component_id)
    }
}

/// Problem identity → tracked incident, plus the component statuses last written
#[derive(Debug, Default)]
pub struct IncidentStore {
    incidents: HashMap<ProblemId, TrackedIncident>,
    published: HashMap<ComponentId, ComponentStatus>,
}

impl IncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    pub fn contains(&self, problem_id: &str) -> bool {
        self.incidents.contains_key(problem_id)
    }

    pub fn get(&self, problem_id: &str) -> Option<&TrackedIncident> {
        self.incidents.get(problem_id)
    }

    pub fn get_mut(&mut self, problem_id: &str) -> Option<&mut TrackedIncident> {
        self.incidents.get_mut(problem_id)
    }

    /// Track a new incident. Refuses to replace an entry for the same problem.
    pub fn insert(&mut self, incident: TrackedIncident) -> bool {
        if self.incidents.contains_key(&incident.problem_id) {
            warn!(
                "Problem {} already tracked by incident {}, not replacing",
                incident.problem_id, self.incidents[&incident.problem_id].incident_id
            );
            return false;
        }
        self.incidents.insert(incident.problem_id.clone(), incident);
        true
    }

    pub fn remove(&mut self, problem_id: &str) -> Option<TrackedIncident> {
        self.incidents.remove(problem_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedIncident> {
        self.incidents.values()
    }

    /// Tracked problem ids in a stable order
    pub fn problem_ids(&self) -> Vec<ProblemId> {
        let mut ids: Vec<ProblemId> = self.incidents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every component referenced by a tracked incident
    pub fn linked_components(&self) -> BTreeSet<ComponentId> {
        self.incidents
            .values()
            .flat_map(|incident| incident.component_ids.iter().cloned())
            .collect()
    }

    /// Worst status across open incidents linked to the component, Operational if none
    pub fn desired_status(&self, component_id: &str) -> ComponentStatus {
        self.incidents
            .values()
            .filter(|incident| incident.is_open() && incident.links(component_id))
            .map(|incident| incident.status)
            .max()
            .unwrap_or(ComponentStatus::Operational)
    }

    pub fn published_status(&self, component_id: &str) -> Option<ComponentStatus> {
        self.published.get(component_id).copied()
    }

    pub fn mark_published(&mut self, component_id: &str, status: ComponentStatus) {
        self.published.insert(component_id.to_string(), status);
    }

    /// Replace the cache with what the status page shows now, so out-of-band edits are seen
    pub fn refresh_published(&mut self, statuses: impl IntoIterator<Item = (ComponentId, ComponentStatus)>) {
        for (component_id, status) in statuses {
            if let Some(previous) = self.published.insert(component_id.clone(), status) {
                if previous != status {
                    debug!("Component {} changed outside the bridge: {} -> {}", component_id, previous, status);
                }
            }
        }
    }

    /// Record what the status page currently shows, without overwriting later writes
    pub fn seed_published(&mut self, statuses: impl IntoIterator<Item = (ComponentId, ComponentStatus)>) {
        for (component_id, status) in statuses {
            self.published.entry(component_id).or_insert(status);
        }
    }

    /// Load unresolved incidents created by the bridge. Newest wins per problem.
    ///
    /// `status_of` gives the status to assume for an incident's components, since the
    /// status page does not remember the severity that opened it.
    pub fn load_remote(
        &mut self,
        remote: &[RemoteIncident],
        status_of: impl Fn(&RemoteIncident) -> ComponentStatus,
    ) -> usize {
        let mut newest: HashMap<&str, &RemoteIncident> = HashMap::new();
        for incident in remote.iter().filter(|i| i.state != IncidentState::Resolved) {
            let Some(problem_id) = incident.problem_id.as_deref() else {
                continue;
            };
            match newest.get(problem_id) {
                Some(existing) if existing.created_at >= incident.created_at => {
                    debug!(
                        "Ignoring older incident {} for problem {}",
                        incident.id, problem_id
                    );
                }
                _ => {
                    newest.insert(problem_id, incident);
                }
            }
        }

        let mut loaded = 0;
        for (problem_id, incident) in newest {
            let mut tracked = TrackedIncident::new(
                incident.id.clone(),
                problem_id.to_string(),
                incident.component_ids.clone(),
                status_of(incident),
            );
            tracked.state = incident.state;
            if incident.state == IncidentState::Acknowledged {
                tracked.last_ack_at = incident.updated_at.or(incident.created_at);
            }
            if self.insert(tracked) {
                loaded += 1;
            }
        }
        loaded
    }

    /// Drop entries whose incident the status page reports resolved or no longer has
    pub fn retain_remote(&mut self, remote: &[RemoteIncident]) -> Vec<ProblemId> {
        let open: HashSet<&str> = remote
            .iter()
            .filter(|incident| incident.state != IncidentState::Resolved)
            .map(|incident| incident.id.as_str())
            .collect();

        let mut dropped: Vec<ProblemId> = self
            .incidents
            .values()
            .filter(|tracked| !open.contains(tracked.incident_id.as_str()))
            .map(|tracked| tracked.problem_id.clone())
            .collect();
        dropped.sort();

        for problem_id in &dropped {
            self.incidents.remove(problem_id);
        }
        dropped
    }
}

/// Where a monitoring service lives on the status page
#[derive(Clone, Debug, PartialEq)]
pub struct MappedComponent {
    pub component_id: ComponentId,
    pub name: String,
    pub group_id: Option<GroupId>,
    pub group_name: Option<String>,
}

/// Monitoring service identity → status page component / group
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComponentMap {
    components: HashMap<ServiceId, MappedComponent>,
    groups: HashMap<ServiceId, ComponentGroup>,
}

pub type SharedComponentMap = Arc<RwLock<ComponentMap>>;

impl ComponentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedComponentMap {
        Arc::new(RwLock::new(self))
    }

    pub fn insert_component(&mut self, service_id: impl Into<String>, component: MappedComponent) {
        self.components.insert(service_id.into(), component);
    }

    pub fn insert_group(&mut self, service_id: impl Into<String>, group: ComponentGroup) {
        self.groups.insert(service_id.into(), group);
    }

    pub fn component(&self, service_id: &str) -> Option<&MappedComponent> {
        self.components.get(service_id)
    }

    pub fn group(&self, service_id: &str) -> Option<&ComponentGroup> {
        self.groups.get(service_id)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Components for the given services, deduplicated, in service order
    pub fn resolve(&self, service_ids: &[ServiceId]) -> Vec<&MappedComponent> {
        let mut seen = HashSet::new();
        service_ids
            .iter()
            .filter_map(|service_id| self.components.get(service_id))
            .filter(|component| seen.insert(component.component_id.as_str()))
            .collect()
    }

    pub fn component_ids(&self) -> BTreeSet<ComponentId> {
        self.components
            .values()
            .map(|component| component.component_id.clone())
            .collect()
    }
}

//! In-memory monitoring and status page fakes for driving the reconcilers

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use zabbix_cachet::config::TemplatesConfig;
use zabbix_cachet::model::{
    Acknowledgement, Component, ComponentGroup, ComponentId, ComponentStatus, GroupId, IncidentId,
    IncidentState, NewIncident, Problem, RemoteIncident, ServiceTree,
};
use zabbix_cachet::state::{ComponentMap, MappedComponent};
use zabbix_cachet::template::{Templates, TimeZoneSetting};
use zabbix_cachet::{BridgeError, MonitoringClient, Result, StatusPageClient};

pub fn templates() -> Templates {
    let utc = TimeZoneSetting::parse(Some("UTC")).unwrap();
    Templates::new(&TemplatesConfig::default(), utc).unwrap()
}

pub fn ack(author: &str, message: &str, minute: u32) -> Acknowledgement {
    Acknowledgement {
        author: author.to_string(),
        message: message.to_string(),
        time: Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap(),
    }
}

pub fn mapped(component_id: &str, name: &str, group: Option<(&str, &str)>) -> MappedComponent {
    MappedComponent {
        component_id: component_id.to_string(),
        name: name.to_string(),
        group_id: group.map(|(id, _)| id.to_string()),
        group_name: group.map(|(_, name)| name.to_string()),
    }
}

/// Storage/DB, plus an ungrouped API component
pub fn sample_map() -> ComponentMap {
    let mut map = ComponentMap::new();
    map.insert_component("s-db", mapped("c-db", "DB", Some(("g-storage", "Storage"))));
    map.insert_component("s-api", mapped("c-api", "API", None));
    map
}

#[derive(Default)]
pub struct FakeMonitoring {
    problems: Mutex<Vec<Problem>>,
    tree: Mutex<ServiceTree>,
    unavailable: AtomicBool,
}

impl FakeMonitoring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_problems(&self, problems: Vec<Problem>) {
        *self.problems.lock().unwrap() = problems;
    }

    pub fn set_tree(&self, tree: ServiceTree) {
        *self.tree.lock().unwrap() = tree;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BridgeError::UpstreamUnavailable("zabbix is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MonitoringClient for FakeMonitoring {
    async fn version(&self) -> Result<String> {
        self.check()?;
        Ok("7.0.0".to_string())
    }

    async fn list_active_problems(&self) -> Result<Vec<Problem>> {
        self.check()?;
        Ok(self.problems.lock().unwrap().clone())
    }

    async fn get_service_tree(&self, _root: Option<&str>) -> Result<ServiceTree> {
        self.check()?;
        Ok(self.tree.lock().unwrap().clone())
    }
}

/// One write received by the fake status page
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    CreateIncident { id: IncidentId, problem_id: String },
    UpdateIncident { id: IncidentId, state: IncidentState },
    ComponentStatus { id: ComponentId, status: ComponentStatus },
    CreateComponent { id: ComponentId, name: String },
    RenameComponent { id: ComponentId, name: String },
    CreateGroup { id: GroupId, name: String },
}

#[derive(Default)]
struct Page {
    next_id: u64,
    incidents: Vec<RemoteIncident>,
    timelines: HashMap<IncidentId, Vec<(IncidentState, String)>>,
    names: HashMap<IncidentId, String>,
    components: Vec<Component>,
    groups: Vec<ComponentGroup>,
    writes: Vec<Write>,
    reject_writes: bool,
    reject_names: HashSet<String>,
    failing_listings: usize,
}

impl Page {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn check_write(&self, name: Option<&str>) -> Result<()> {
        if self.reject_writes || name.is_some_and(|n| self.reject_names.contains(n)) {
            return Err(BridgeError::UpstreamUnavailable("cachet is down".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStatusPage {
    page: Mutex<Page>,
}

impl FakeStatusPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the components of `sample_map` as existing, all Operational
    pub fn with_sample_components() -> Self {
        let fake = Self::new();
        fake.add_group("g-storage", "Storage");
        fake.add_component("c-db", "DB", Some("g-storage"), ComponentStatus::Operational);
        fake.add_component("c-api", "API", None, ComponentStatus::Operational);
        fake
    }

    pub fn add_group(&self, id: &str, name: &str) {
        self.page.lock().unwrap().groups.push(ComponentGroup {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn add_component(&self, id: &str, name: &str, group_id: Option<&str>, status: ComponentStatus) {
        self.page.lock().unwrap().components.push(Component {
            id: id.to_string(),
            name: name.to_string(),
            group_id: group_id.map(str::to_string),
            status,
        });
    }

    pub fn reject_writes(&self, reject: bool) {
        self.page.lock().unwrap().reject_writes = reject;
    }

    /// Fail creates of components or groups with this name
    pub fn reject_name(&self, name: &str) {
        self.page.lock().unwrap().reject_names.insert(name.to_string());
    }

    pub fn accept_all_names(&self) {
        self.page.lock().unwrap().reject_names.clear();
    }

    /// Fail the next `count` incident listings
    pub fn fail_incident_listings(&self, count: usize) {
        self.page.lock().unwrap().failing_listings = count;
    }

    /// Change a component's status by hand, as an operator would in the dashboard
    pub fn set_status(&self, id: &str, status: ComponentStatus) {
        if let Some(component) = self.page.lock().unwrap().components.iter_mut().find(|c| c.id == id) {
            component.status = status;
        }
    }

    pub fn writes(&self) -> Vec<Write> {
        self.page.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.page.lock().unwrap().writes.len()
    }

    pub fn incidents(&self) -> Vec<RemoteIncident> {
        self.page.lock().unwrap().incidents.clone()
    }

    pub fn incident_name(&self, id: &str) -> Option<String> {
        self.page.lock().unwrap().names.get(id).cloned()
    }

    pub fn timeline(&self, id: &str) -> Vec<(IncidentState, String)> {
        self.page.lock().unwrap().timelines.get(id).cloned().unwrap_or_default()
    }

    pub fn components(&self) -> Vec<Component> {
        self.page.lock().unwrap().components.clone()
    }

    pub fn groups(&self) -> Vec<ComponentGroup> {
        self.page.lock().unwrap().groups.clone()
    }

    pub fn component_status(&self, id: &str) -> Option<ComponentStatus> {
        self.page
            .lock()
            .unwrap()
            .components
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.status)
    }
}

#[async_trait]
impl StatusPageClient for FakeStatusPage {
    async fn version(&self) -> Result<String> {
        Ok("3.0.0".to_string())
    }

    async fn create_incident(&self, incident: &NewIncident) -> Result<IncidentId> {
        let mut page = self.page.lock().unwrap();
        page.check_write(None)?;
        let id = page.next_id();
        page.incidents.push(RemoteIncident {
            id: id.clone(),
            name: incident.name.clone(),
            // Cachet keeps a single component per incident
            component_ids: incident.component_ids.iter().take(1).cloned().collect(),
            state: incident.state,
            problem_id: Some(incident.problem_id.clone()),
            created_at: Some(Utc::now()),
            updated_at: None,
        });
        page.timelines
            .insert(id.clone(), vec![(incident.state, incident.message.clone())]);
        page.names.insert(id.clone(), incident.name.clone());
        page.writes.push(Write::CreateIncident {
            id: id.clone(),
            problem_id: incident.problem_id.clone(),
        });
        Ok(id)
    }

    async fn append_incident_update(&self, incident_id: &str, state: IncidentState, text: &str) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.check_write(None)?;
        let Some(incident) = page.incidents.iter_mut().find(|i| i.id == incident_id) else {
            return Err(BridgeError::UpstreamRejected(format!("no incident {}", incident_id)));
        };
        incident.state = state;
        incident.updated_at = Some(Utc::now());
        page.timelines
            .entry(incident_id.to_string())
            .or_default()
            .push((state, text.to_string()));
        page.writes.push(Write::UpdateIncident {
            id: incident_id.to_string(),
            state,
        });
        Ok(())
    }

    async fn set_component_status(&self, component_id: &str, status: ComponentStatus) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.check_write(None)?;
        if let Some(component) = page.components.iter_mut().find(|c| c.id == component_id) {
            component.status = status;
        }
        page.writes.push(Write::ComponentStatus {
            id: component_id.to_string(),
            status,
        });
        Ok(())
    }

    async fn create_component(
        &self,
        name: &str,
        group_id: Option<&str>,
        status: ComponentStatus,
    ) -> Result<ComponentId> {
        let mut page = self.page.lock().unwrap();
        page.check_write(Some(name))?;
        let id = page.next_id();
        page.components.push(Component {
            id: id.clone(),
            name: name.to_string(),
            group_id: group_id.map(str::to_string),
            status,
        });
        page.writes.push(Write::CreateComponent {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn rename_component(&self, component_id: &str, name: &str) -> Result<()> {
        let mut page = self.page.lock().unwrap();
        page.check_write(None)?;
        if let Some(component) = page.components.iter_mut().find(|c| c.id == component_id) {
            component.name = name.to_string();
        }
        page.writes.push(Write::RenameComponent {
            id: component_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn create_group(&self, name: &str) -> Result<GroupId> {
        let mut page = self.page.lock().unwrap();
        page.check_write(Some(name))?;
        let id = page.next_id();
        page.groups.push(ComponentGroup {
            id: id.clone(),
            name: name.to_string(),
        });
        page.writes.push(Write::CreateGroup {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn list_components(&self) -> Result<Vec<Component>> {
        Ok(self.components())
    }

    async fn list_groups(&self) -> Result<Vec<ComponentGroup>> {
        Ok(self.groups())
    }

    async fn list_incidents(&self) -> Result<Vec<RemoteIncident>> {
        let mut page = self.page.lock().unwrap();
        if page.failing_listings > 0 {
            page.failing_listings -= 1;
            return Err(BridgeError::UpstreamUnavailable("cachet is down".to_string()));
        }
        Ok(page.incidents.clone())
    }
}

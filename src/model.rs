//! Data structures shared by the monitoring side, the status page side and the reconcilers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Zabbix event id of a problem, kept verbatim as the cross-cycle join key
pub type ProblemId = String;
/// Zabbix IT service id
pub type ServiceId = String;
pub type ComponentId = String;
pub type GroupId = String;
pub type IncidentId = String;

/// Zabbix trigger/problem severity
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    NotClassified,
    Information,
    Warning,
    Average,
    High,
    Disaster,
}

impl Severity {
    pub fn from_zabbix(value: i64) -> Self {
        match value {
            1 => Severity::Information,
            2 => Severity::Warning,
            3 => Severity::Average,
            4 => Severity::High,
            5 => Severity::Disaster,
            _ => Severity::NotClassified,
        }
    }

    /// Component status shown while a problem of this severity is open
    pub fn component_status(self) -> ComponentStatus {
        match self {
            Severity::High | Severity::Disaster => ComponentStatus::MajorOutage,
            Severity::Average => ComponentStatus::PartialOutage,
            _ => ComponentStatus::PerformanceIssues,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::NotClassified => write!(f, "NOT_CLASSIFIED"),
            Severity::Information => write!(f, "INFORMATION"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Average => write!(f, "AVERAGE"),
            Severity::High => write!(f, "HIGH"),
            Severity::Disaster => write!(f, "DISASTER"),
        }
    }
}

/// A single acknowledgement left on a problem
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Acknowledgement {
    pub author: String,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl Acknowledgement {
    /// Identity of the entry; Zabbix clocks have one second resolution, so time alone is not enough
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.time.timestamp(), self.author, self.message)
    }
}

/// An active fault reported by the monitoring system
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub id: ProblemId,
    pub trigger_id: String,
    pub trigger_name: String,
    pub trigger_description: String,
    pub severity: Severity,
    pub service_ids: Vec<ServiceId>,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledgements: Vec<Acknowledgement>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Problem {
    pub fn new(id: impl Into<String>, trigger_name: impl Into<String>, severity: Severity) -> Self {
        Self {
            id: id.into(),
            trigger_id: String::new(),
            trigger_name: trigger_name.into(),
            trigger_description: String::new(),
            severity,
            service_ids: Vec::new(),
            created_at: Utc::now(),
            acknowledged: false,
            acknowledgements: Vec::new(),
            resolved_at: None,
        }
    }

    pub fn with_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_ids.push(service_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.trigger_description = description.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_acknowledgement(mut self, ack: Acknowledgement) -> Self {
        self.acknowledged = true;
        self.acknowledgements.push(ack);
        self
    }

    /// Acknowledgements not yet posted, oldest first.
    ///
    /// An entry is pending when it is not older than `since` and its key is not in `posted`.
    pub fn pending_acknowledgements(
        &self,
        since: Option<DateTime<Utc>>,
        posted: &HashSet<String>,
    ) -> Vec<&Acknowledgement> {
        let mut acks: Vec<&Acknowledgement> = self
            .acknowledgements
            .iter()
            .filter(|ack| since.is_none_or(|seen| ack.time >= seen))
            .filter(|ack| !posted.contains(&ack.key()))
            .collect();
        acks.sort_by_key(|ack| ack.time);
        acks
    }
}

/// Aggregate health of an IT service as reported by Zabbix (-1 OK, 0..5 severity)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceHealth {
    Ok,
    Problem(Severity),
}

impl ServiceHealth {
    pub fn from_zabbix(value: i64) -> Self {
        if value < 0 {
            ServiceHealth::Ok
        } else {
            ServiceHealth::Problem(Severity::from_zabbix(value))
        }
    }

    /// Status a freshly created component starts with
    pub fn component_status(self) -> ComponentStatus {
        match self {
            ServiceHealth::Ok | ServiceHealth::Problem(Severity::Information) => {
                ComponentStatus::Operational
            }
            ServiceHealth::Problem(Severity::NotClassified) => ComponentStatus::Unknown,
            ServiceHealth::Problem(Severity::Warning) => ComponentStatus::PerformanceIssues,
            ServiceHealth::Problem(Severity::Average) => ComponentStatus::PartialOutage,
            ServiceHealth::Problem(_) => ComponentStatus::MajorOutage,
        }
    }
}

/// A node of the Zabbix IT service tree
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub name: String,
    pub parent_ids: Vec<ServiceId>,
    pub health: ServiceHealth,
}

impl Service {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_ids: Vec::new(),
            health: ServiceHealth::Ok,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceNode {
    pub service: Service,
    pub children: Vec<ServiceNode>,
}

impl ServiceNode {
    pub fn leaf(service: Service) -> Self {
        Self { service, children: Vec::new() }
    }

    pub fn with_children(service: Service, children: Vec<ServiceNode>) -> Self {
        Self { service, children }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Service forest below the configured root (the root itself is not included)
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceTree {
    pub nodes: Vec<ServiceNode>,
}

impl ServiceTree {
    pub fn new(nodes: Vec<ServiceNode>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Displayed status of a status page component.
///
/// Variant order is the aggregation order: the worst open incident wins.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentStatus {
    Operational,
    Unknown,
    PerformanceIssues,
    PartialOutage,
    MajorOutage,
}

impl ComponentStatus {
    /// Cachet status code
    pub fn code(self) -> i64 {
        match self {
            ComponentStatus::Operational => 1,
            ComponentStatus::PerformanceIssues => 2,
            ComponentStatus::PartialOutage => 3,
            ComponentStatus::MajorOutage => 4,
            ComponentStatus::Unknown => 5,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ComponentStatus::Operational,
            2 => ComponentStatus::PerformanceIssues,
            3 => ComponentStatus::PartialOutage,
            4 => ComponentStatus::MajorOutage,
            _ => ComponentStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentStatus::Operational => write!(f, "Operational"),
            ComponentStatus::PerformanceIssues => write!(f, "Performance Issues"),
            ComponentStatus::PartialOutage => write!(f, "Partial Outage"),
            ComponentStatus::MajorOutage => write!(f, "Major Outage"),
            ComponentStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Lifecycle state of a tracked incident; only ever moves forward
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IncidentState {
    Investigating,
    Acknowledged,
    Resolved,
}

impl IncidentState {
    /// Cachet incident status code (Acknowledged is Cachet's "Identified")
    pub fn code(self) -> i64 {
        match self {
            IncidentState::Investigating => 1,
            IncidentState::Acknowledged => 2,
            IncidentState::Resolved => 4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            2 | 3 => IncidentState::Acknowledged,
            4 => IncidentState::Resolved,
            _ => IncidentState::Investigating,
        }
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentState::Investigating => write!(f, "Investigating"),
            IncidentState::Acknowledged => write!(f, "Acknowledged"),
            IncidentState::Resolved => write!(f, "Resolved"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    pub group_id: Option<GroupId>,
    pub status: ComponentStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ComponentGroup {
    pub id: GroupId,
    pub name: String,
}

/// An incident as listed by the status page
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoteIncident {
    pub id: IncidentId,
    pub name: String,
    pub component_ids: Vec<ComponentId>,
    pub state: IncidentState,
    /// Problem identity recovered from the incident body, if it was created by us
    pub problem_id: Option<ProblemId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Everything needed to open an incident on the status page
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewIncident {
    pub problem_id: ProblemId,
    pub name: String,
    pub message: String,
    pub state: IncidentState,
    pub component_ids: Vec<ComponentId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_severity_to_component_status() {
        assert_eq!(Severity::Disaster.component_status(), ComponentStatus::MajorOutage);
        assert_eq!(Severity::High.component_status(), ComponentStatus::MajorOutage);
        assert_eq!(Severity::Average.component_status(), ComponentStatus::PartialOutage);
        assert_eq!(Severity::Warning.component_status(), ComponentStatus::PerformanceIssues);
        assert_eq!(Severity::from_zabbix(42), Severity::NotClassified);
    }

    #[test]
    fn test_service_health_from_zabbix() {
        assert_eq!(ServiceHealth::from_zabbix(-1), ServiceHealth::Ok);
        assert_eq!(
            ServiceHealth::from_zabbix(0).component_status(),
            ComponentStatus::Unknown
        );
        assert_eq!(
            ServiceHealth::from_zabbix(1).component_status(),
            ComponentStatus::Operational
        );
        assert_eq!(
            ServiceHealth::from_zabbix(5).component_status(),
            ComponentStatus::MajorOutage
        );
    }

    #[test]
    fn test_component_status_ordering() {
        assert!(ComponentStatus::MajorOutage > ComponentStatus::PartialOutage);
        assert!(ComponentStatus::PartialOutage > ComponentStatus::PerformanceIssues);
        assert!(ComponentStatus::PerformanceIssues > ComponentStatus::Operational);
        assert_eq!(ComponentStatus::from_code(ComponentStatus::Unknown.code()), ComponentStatus::Unknown);
    }

    #[test]
    fn test_incident_state_codes() {
        assert_eq!(IncidentState::from_code(3), IncidentState::Acknowledged);
        assert_eq!(IncidentState::from_code(0), IncidentState::Investigating);
        assert_eq!(IncidentState::Resolved.code(), 4);
        assert!(IncidentState::Resolved > IncidentState::Acknowledged);
    }

    #[test]
    fn test_pending_acknowledgements_sorted_and_filtered() {
        let at = |h| Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap();
        let ack = |h, who: &str| Acknowledgement {
            author: who.to_string(),
            message: String::new(),
            time: at(h),
        };

        let problem = Problem::new("100", "disk full", Severity::High)
            .with_acknowledgement(ack(12, "Carol"))
            .with_acknowledgement(ack(10, "Alice"))
            .with_acknowledgement(ack(11, "Bob"));

        let none = HashSet::new();
        let all: Vec<_> = problem
            .pending_acknowledgements(None, &none)
            .iter()
            .map(|a| a.author.clone())
            .collect();
        assert_eq!(all, vec!["Alice", "Bob", "Carol"]);

        let posted: HashSet<String> = [ack(11, "Bob").key()].into_iter().collect();
        let newer = problem.pending_acknowledgements(Some(at(11)), &posted);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].author, "Carol");
    }

    #[test]
    fn test_same_second_acknowledgements_are_distinct() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let first = Acknowledgement {
            author: "Alice".to_string(),
            message: "on it".to_string(),
            time,
        };
        let second = Acknowledgement {
            author: "Bob".to_string(),
            message: "me too".to_string(),
            time,
        };
        let problem = Problem::new("100", "disk full", Severity::High)
            .with_acknowledgement(first.clone())
            .with_acknowledgement(second);

        let posted: HashSet<String> = [first.key()].into_iter().collect();
        let pending = problem.pending_acknowledgements(Some(time), &posted);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].author, "Bob");
    }
}

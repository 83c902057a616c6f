//! Component reconciliation: keeps status page groups and components in line with the service tree

use crate::errors::Result;
use crate::model::{Component, ComponentGroup, Service, ServiceNode};
use crate::monitoring::MonitoringClient;
use crate::state::{ComponentMap, MappedComponent, SharedComponentMap};
use crate::statuspage::StatusPageClient;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What one component cycle changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub components_created: usize,
    pub groups_created: usize,
    /// Existing status page objects matched by name
    pub adopted: usize,
    pub renamed: usize,
    /// Services kept on their previous mapping after a failed lookup or create
    pub carried_over: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn writes(&self) -> usize {
        self.components_created + self.groups_created + self.renamed
    }
}

pub struct ComponentReconciler {
    monitoring: Arc<dyn MonitoringClient>,
    status_page: Arc<dyn StatusPageClient>,
    root_service: Option<String>,
}

/// Group a node's leaf children land in
enum Placement {
    Ungrouped,
    Group(ComponentGroup),
    /// The group could not be resolved; children only keep previous mappings
    Unavailable,
}

/// Per-cycle working state
struct SyncPass {
    previous: ComponentMap,
    next: ComponentMap,
    groups: Vec<ComponentGroup>,
    components: Vec<Component>,
    report: SyncReport,
}

impl ComponentReconciler {
    pub fn new(
        monitoring: Arc<dyn MonitoringClient>,
        status_page: Arc<dyn StatusPageClient>,
        root_service: Option<String>,
    ) -> Self {
        Self {
            monitoring,
            status_page,
            root_service,
        }
    }

    /// One pass over the service tree. The map is replaced only when the pass completes.
    #[instrument(skip_all, fields(cycle_id = %uuid::Uuid::new_v4()))]
    pub async fn run_cycle(&self, map: &SharedComponentMap) -> Result<SyncReport> {
        let tree = self.monitoring.get_service_tree(self.root_service.as_deref()).await?;
        if tree.is_empty() {
            warn!(
                "Service tree under {} is empty",
                self.root_service.as_deref().unwrap_or("<all services>")
            );
        }

        let groups = self.status_page.list_groups().await?;
        let components = self.status_page.list_components().await?;
        let previous = map.read().await.clone();
        let mut sync = SyncPass {
            previous,
            next: ComponentMap::new(),
            groups,
            components,
            report: SyncReport::default(),
        };

        // (node, placement of the node itself when it is a leaf)
        let mut pending: Vec<(&ServiceNode, Placement)> = tree
            .nodes
            .iter()
            .rev()
            .map(|node| (node, Placement::Ungrouped))
            .collect();

        while let Some((node, placement)) = pending.pop() {
            if node.is_leaf() {
                self.sync_component(&node.service, &placement, &mut sync).await;
                continue;
            }

            let group = match self.sync_group(&node.service, &mut sync).await {
                Some(group) => Placement::Group(group),
                None => Placement::Unavailable,
            };
            for child in node.children.iter().rev() {
                let placement = match (&group, child.is_leaf()) {
                    (Placement::Group(g), true) => Placement::Group(g.clone()),
                    (Placement::Unavailable, true) => Placement::Unavailable,
                    _ => Placement::Ungrouped,
                };
                pending.push((child, placement));
            }
        }

        let SyncPass { next, report, .. } = sync;
        info!(
            "Component cycle - {} components in {} groups; created: {} components, {} groups; adopted: {}, renamed: {}, carried over: {}, failed: {}",
            next.len(),
            next.group_count(),
            report.components_created,
            report.groups_created,
            report.adopted,
            report.renamed,
            report.carried_over,
            report.failed
        );
        *map.write().await = next;
        Ok(report)
    }

    async fn sync_group(&self, service: &Service, sync: &mut SyncPass) -> Option<ComponentGroup> {
        if let Some(group) = sync.next.group(&service.id) {
            return Some(group.clone());
        }

        let known = sync
            .previous
            .group(&service.id)
            .filter(|g| sync.groups.iter().any(|existing| existing.id == g.id))
            .cloned();

        let group = match known {
            Some(group) => group,
            None => match sync.groups.iter().find(|g| g.name == service.name) {
                Some(group) => {
                    debug!("Adopting component group {} ({})", group.name, group.id);
                    sync.report.adopted += 1;
                    group.clone()
                }
                None => match self.status_page.create_group(&service.name).await {
                    Ok(id) => {
                        let group = ComponentGroup {
                            id,
                            name: service.name.clone(),
                        };
                        sync.groups.push(group.clone());
                        sync.report.groups_created += 1;
                        group
                    }
                    Err(e) => {
                        error!("Failed to create component group {}: {}", service.name, e);
                        sync.report.failed += 1;
                        let previous = sync.previous.group(&service.id).cloned()?;
                        sync.report.carried_over += 1;
                        previous
                    }
                },
            },
        };

        sync.next.insert_group(service.id.clone(), group.clone());
        Some(group)
    }

    async fn sync_component(&self, service: &Service, placement: &Placement, sync: &mut SyncPass) {
        if sync.next.component(&service.id).is_some() {
            return;
        }

        let group = match placement {
            Placement::Group(group) => Some(group),
            Placement::Ungrouped => None,
            Placement::Unavailable => {
                self.carry_over(service, sync);
                return;
            }
        };
        let group_id = group.map(|g| g.id.clone());

        let known = sync
            .previous
            .component(&service.id)
            .filter(|c| sync.components.iter().any(|existing| existing.id == c.component_id))
            .map(|c| c.component_id.clone());
        let adoptable = sync
            .components
            .iter()
            .find(|c| c.name == service.name && c.group_id == group_id)
            .map(|c| c.id.clone());

        let component_id = if let Some(id) = known {
            id
        } else if let Some(id) = adoptable {
            debug!("Adopting component {} ({})", service.name, id);
            sync.report.adopted += 1;
            id
        } else {
            let status = service.health.component_status();
            match self
                .status_page
                .create_component(&service.name, group_id.as_deref(), status)
                .await
            {
                Ok(id) => {
                    sync.components.push(Component {
                        id: id.clone(),
                        name: service.name.clone(),
                        group_id: group_id.clone(),
                        status,
                    });
                    sync.report.components_created += 1;
                    id
                }
                Err(e) => {
                    error!("Failed to create component {}: {}", service.name, e);
                    sync.report.failed += 1;
                    self.carry_over(service, sync);
                    return;
                }
            }
        };

        let current_name = sync
            .components
            .iter()
            .find(|c| c.id == component_id)
            .map(|c| c.name.clone());
        let mut name = service.name.clone();
        if let Some(current) = current_name.filter(|current| *current != service.name) {
            match self.status_page.rename_component(&component_id, &service.name).await {
                Ok(()) => sync.report.renamed += 1,
                Err(e) => {
                    warn!("Failed to rename component {} to {}: {}", current, service.name, e);
                    sync.report.failed += 1;
                    name = current;
                }
            }
        }

        sync.next.insert_component(
            service.id.clone(),
            MappedComponent {
                component_id,
                name,
                group_id,
                group_name: group.map(|g| g.name.clone()),
            },
        );
    }

    fn carry_over(&self, service: &Service, sync: &mut SyncPass) {
        if let Some(previous) = sync.previous.component(&service.id).cloned() {
            warn!("Keeping previous mapping of {} to component {}", service.name, previous.component_id);
            sync.next.insert_component(service.id.clone(), previous);
            sync.report.carried_over += 1;
        }
    }
}

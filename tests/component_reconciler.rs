mod common;

use common::{FakeMonitoring, FakeStatusPage, Write};
use std::sync::Arc;
use tokio_test::assert_ok;
use zabbix_cachet::model::{ComponentStatus, Service, ServiceHealth, ServiceNode, ServiceTree, Severity};
use zabbix_cachet::{BridgeError, ComponentMap, ComponentReconciler, SharedComponentMap};

fn service(id: &str, name: &str) -> Service {
    Service::new(id, name)
}

/// Storage { DB, Files }, plus a top-level API service
fn tree(db_name: &str) -> ServiceTree {
    let mut files = service("s-files", "Files");
    files.health = ServiceHealth::Problem(Severity::Average);

    ServiceTree::new(vec![
        ServiceNode::with_children(
            service("s-storage", "Storage"),
            vec![
                ServiceNode::leaf(service("s-db", db_name)),
                ServiceNode::leaf(files),
            ],
        ),
        ServiceNode::leaf(service("s-api", "API")),
    ])
}

fn setup() -> (Arc<FakeMonitoring>, Arc<FakeStatusPage>, ComponentReconciler, SharedComponentMap) {
    let monitoring = Arc::new(FakeMonitoring::new());
    let page = Arc::new(FakeStatusPage::new());
    let reconciler = ComponentReconciler::new(monitoring.clone(), page.clone(), None);
    (monitoring, page, reconciler, ComponentMap::new().shared())
}

#[tokio::test]
async fn test_builds_groups_and_components() {
    let (monitoring, page, reconciler, map) = setup();
    monitoring.set_tree(tree("DB"));

    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.groups_created, 1);
    assert_eq!(report.components_created, 3);

    let map = map.read().await;
    assert_eq!(map.len(), 3);
    assert_eq!(map.group_count(), 1);
    let db = map.component("s-db").unwrap();
    assert_eq!(db.group_name.as_deref(), Some("Storage"));
    assert_eq!(map.component("s-api").unwrap().group_id, None);

    let files = page
        .components()
        .into_iter()
        .find(|c| c.name == "Files")
        .unwrap();
    assert_eq!(files.status, ComponentStatus::PartialOutage);
    assert_eq!(files.group_id, db.group_id);
}

#[tokio::test]
async fn test_rerun_on_unchanged_tree_creates_nothing() {
    let (monitoring, page, reconciler, map) = setup();
    monitoring.set_tree(tree("DB"));

    assert_ok!(reconciler.run_cycle(&map).await);
    let writes = page.write_count();
    let before = map.read().await.clone();

    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.writes(), 0);
    assert_eq!(page.write_count(), writes);
    assert_eq!(page.components().len(), 3);
    assert_eq!(page.groups().len(), 1);
    assert_eq!(*map.read().await, before);
}

#[tokio::test]
async fn test_adopts_existing_objects_after_restart() {
    let (monitoring, page, reconciler, map) = setup();
    page.add_group("40", "Storage");
    page.add_component("41", "DB", Some("40"), ComponentStatus::Operational);
    // Same name, wrong group: not adopted
    page.add_component("42", "API", Some("40"), ComponentStatus::Operational);
    monitoring.set_tree(tree("DB"));

    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.adopted, 2);
    assert_eq!(report.groups_created, 0);
    assert_eq!(report.components_created, 2);

    let map = map.read().await;
    assert_eq!(map.component("s-db").unwrap().component_id, "41");
    assert_ne!(map.component("s-api").unwrap().component_id, "42");
}

#[tokio::test]
async fn test_renames_drifted_component() {
    let (monitoring, page, reconciler, map) = setup();
    monitoring.set_tree(tree("DB"));
    assert_ok!(reconciler.run_cycle(&map).await);
    let db_id = map.read().await.component("s-db").unwrap().component_id.clone();

    monitoring.set_tree(tree("Database"));
    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.renamed, 1);
    assert_eq!(report.components_created, 0);

    assert!(page.writes().contains(&Write::RenameComponent {
        id: db_id.clone(),
        name: "Database".to_string(),
    }));
    let map = map.read().await;
    let db = map.component("s-db").unwrap();
    assert_eq!(db.component_id, db_id);
    assert_eq!(db.name, "Database");
}

#[tokio::test]
async fn test_failed_create_is_skipped_and_retried() {
    let (monitoring, page, reconciler, map) = setup();
    monitoring.set_tree(tree("DB"));
    page.reject_name("Files");

    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.failed, 1);
    assert_eq!(report.components_created, 2);
    assert!(map.read().await.component("s-files").is_none());

    page.accept_all_names();
    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.components_created, 1);
    assert_eq!(map.read().await.len(), 3);
}

#[tokio::test]
async fn test_renamed_group_service_keeps_its_group() {
    let (monitoring, page, reconciler, map) = setup();
    monitoring.set_tree(tree("DB"));
    assert_ok!(reconciler.run_cycle(&map).await);
    let before = map.read().await.clone();

    // Known groups are matched by id, so no new group is attempted
    let renamed = ServiceTree::new(vec![ServiceNode::with_children(
        service("s-storage", "Persistence"),
        vec![ServiceNode::leaf(service("s-db", "DB"))],
    )]);
    monitoring.set_tree(renamed);

    let report = assert_ok!(reconciler.run_cycle(&map).await);
    assert_eq!(report.writes(), 0);
    assert_eq!(map.read().await.component("s-db"), before.component("s-db"));
    assert_eq!(page.groups().len(), 1);
}

#[tokio::test]
async fn test_tree_fetch_failure_keeps_map() {
    let (monitoring, _page, reconciler, map) = setup();
    monitoring.set_tree(tree("DB"));
    assert_ok!(reconciler.run_cycle(&map).await);
    let before = map.read().await.clone();

    monitoring.set_unavailable(true);
    let err = reconciler.run_cycle(&map).await.unwrap_err();
    assert!(matches!(err, BridgeError::UpstreamUnavailable(_)));
    assert_eq!(*map.read().await, before);
}

//! Status page side: the capability the reconcilers write to, and its Cachet implementation

use crate::config::CachetConfig;
use crate::errors::{BridgeError, Result};
use crate::model::{
    Component, ComponentGroup, ComponentId, ComponentStatus, GroupId, IncidentId, IncidentState,
    NewIncident, RemoteIncident,
};
use crate::transport::{HttpTransport, RetryPolicy, TransportOptions};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Read/write view of the status page
#[async_trait]
pub trait StatusPageClient: Send + Sync {
    async fn version(&self) -> Result<String>;

    async fn create_incident(&self, incident: &NewIncident) -> Result<IncidentId>;

    /// Add a timeline entry and move the incident to `state`
    async fn append_incident_update(&self, incident_id: &str, state: IncidentState, text: &str) -> Result<()>;

    async fn set_component_status(&self, component_id: &str, status: ComponentStatus) -> Result<()>;

    async fn create_component(
        &self,
        name: &str,
        group_id: Option<&str>,
        status: ComponentStatus,
    ) -> Result<ComponentId>;

    async fn rename_component(&self, component_id: &str, name: &str) -> Result<()>;

    async fn create_group(&self, name: &str) -> Result<GroupId>;

    async fn list_components(&self) -> Result<Vec<Component>>;

    async fn list_groups(&self) -> Result<Vec<ComponentGroup>>;

    async fn list_incidents(&self) -> Result<Vec<RemoteIncident>>;
}

const PROBLEM_MARKER_PREFIX: &str = "<!-- zabbix-cachet:problem=";
const PROBLEM_MARKER_SUFFIX: &str = " -->";
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 500;

/// Append the hidden marker that lets a restarted bridge find its own incidents
pub fn with_problem_marker(message: &str, problem_id: &str) -> String {
    format!(
        "{}\n\n{}{}{}",
        message.trim_end(),
        PROBLEM_MARKER_PREFIX,
        problem_id,
        PROBLEM_MARKER_SUFFIX
    )
}

pub fn parse_problem_marker(message: &str) -> Option<String> {
    let start = message.find(PROBLEM_MARKER_PREFIX)? + PROBLEM_MARKER_PREFIX.len();
    let rest = &message[start..];
    let end = rest.find(PROBLEM_MARKER_SUFFIX)?;
    let id = rest[..end].trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Cachet REST client
#[derive(Debug, Clone)]
pub struct CachetClient {
    transport: HttpTransport,
}

impl CachetClient {
    pub async fn new(config: &CachetConfig, options: TransportOptions) -> Result<Self> {
        let base = format!("{}/api", config.server.trim_end_matches('/'));
        let transport = HttpTransport::new(base, options)?;
        transport.set_bearer_token(Some(config.token.clone())).await;
        Ok(Self { transport })
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Fetch every page of a listing
    async fn get_all(&self, path: &str, extra: &[(&str, String)]) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let mut query = vec![("page", page.to_string()), ("per_page", PAGE_SIZE.to_string())];
            query.extend(extra.iter().cloned());

            let response = self.transport.get(path, &query).await?;
            let data = response["data"].as_array().cloned().unwrap_or_default();
            if data.is_empty() {
                break;
            }
            items.extend(data);

            let last_page = response["meta"]["last_page"]
                .as_u64()
                .or_else(|| response["meta"]["pagination"]["total_pages"].as_u64());
            match last_page {
                Some(last) if u64::from(page) >= last => break,
                None if response["links"]["next"].is_null() => break,
                _ => {}
            }

            page += 1;
            if page > MAX_PAGES {
                warn!("Stopped paging {} after {} pages", path, MAX_PAGES);
                break;
            }
        }

        debug!("Fetched {} items from {}", items.len(), path);
        Ok(items)
    }

    fn created_id(response: &Value, what: &str) -> Result<String> {
        let id = id_of(&response["data"]);
        if id.is_empty() {
            return Err(BridgeError::UpstreamProtocolError(format!(
                "Cachet did not return an id for the new {}",
                what
            )));
        }
        Ok(id)
    }
}

/// Cachet 3 wraps fields in `attributes`; Cachet 2 does not
fn attributes(item: &Value) -> &Value {
    match item.get("attributes") {
        Some(attrs) if attrs.is_object() => attrs,
        _ => item,
    }
}

fn id_of(item: &Value) -> String {
    match &item["id"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn optional_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() && s != "0" => Some(s.clone()),
        Value::Number(n) if n.as_i64() != Some(0) => Some(n.to_string()),
        _ => None,
    }
}

/// Status is a number, a numeric string, or `{ "value": n, "human": ".." }`
fn status_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(_) => status_code(&value["value"]),
        _ => None,
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str().or_else(|| value["string"].as_str())?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|t| t.and_utc())
        })
}

pub fn parse_component(item: &Value) -> Component {
    let attrs = attributes(item);
    let group_id = optional_id(&item["relationships"]["group"]["data"]["id"])
        .or_else(|| optional_id(&attrs["component_group_id"]))
        .or_else(|| optional_id(&attrs["group_id"]));

    Component {
        id: id_of(item),
        name: attrs["name"].as_str().unwrap_or_default().to_string(),
        group_id,
        status: ComponentStatus::from_code(status_code(&attrs["status"]).unwrap_or(5)),
    }
}

pub fn parse_group(item: &Value) -> ComponentGroup {
    ComponentGroup {
        id: id_of(item),
        name: attributes(item)["name"].as_str().unwrap_or_default().to_string(),
    }
}

pub fn parse_incident(item: &Value) -> RemoteIncident {
    let attrs = attributes(item);
    let component_ids = optional_id(&attrs["component_id"])
        .or_else(|| optional_id(&item["relationships"]["component"]["data"]["id"]))
        .into_iter()
        .collect();

    RemoteIncident {
        id: id_of(item),
        name: attrs["name"].as_str().unwrap_or_default().to_string(),
        component_ids,
        state: IncidentState::from_code(status_code(&attrs["status"]).unwrap_or(1)),
        problem_id: attrs["message"].as_str().and_then(parse_problem_marker),
        created_at: parse_time(&attrs["created_at"]),
        updated_at: parse_time(&attrs["updated_at"]),
    }
}

#[async_trait]
impl StatusPageClient for CachetClient {
    async fn version(&self) -> Result<String> {
        let response = self.transport.get("version", &[]).await?;
        let version = &response["data"];
        Ok(version
            .as_str()
            .map(str::to_string)
            .or_else(|| attributes(version)["cachet_version"].as_str().map(str::to_string))
            .unwrap_or_else(|| version.to_string()))
    }

    async fn create_incident(&self, incident: &NewIncident) -> Result<IncidentId> {
        // Cachet links one component per incident; the others get their status from the reconciler
        let component_id = incident.component_ids.first().and_then(|id| id.parse::<i64>().ok());
        let body = json!({
            "name": incident.name,
            "message": with_problem_marker(&incident.message, &incident.problem_id),
            "status": incident.state.code(),
            "component_id": component_id,
            "visible": true,
            "notify": true,
        });

        let response = self
            .transport
            .post("incidents", &body, RetryPolicy::RateLimitOnly)
            .await?;
        let id = Self::created_id(&response, "incident")?;
        info!(
            "Incident {} (id={}) was created for problem {}",
            incident.name, id, incident.problem_id
        );
        Ok(id)
    }

    async fn append_incident_update(&self, incident_id: &str, state: IncidentState, text: &str) -> Result<()> {
        let body = json!({ "status": state.code(), "message": text });
        self.transport
            .post(&format!("incidents/{}/updates", incident_id), &body, RetryPolicy::RateLimitOnly)
            .await?;

        // The update is posted; a failure to sync the headline status must not cause a re-post
        if let Err(e) = self
            .transport
            .put(&format!("incidents/{}", incident_id), &json!({ "status": state.code() }))
            .await
        {
            warn!("Incident {} status not synced to {}: {}", incident_id, state, e);
        }

        info!("Incident {} was updated. Status - {}", incident_id, state);
        Ok(())
    }

    async fn set_component_status(&self, component_id: &str, status: ComponentStatus) -> Result<()> {
        self.transport
            .put(&format!("components/{}", component_id), &json!({ "status": status.code() }))
            .await?;
        info!("Component {} status set to {}", component_id, status);
        Ok(())
    }

    async fn create_component(
        &self,
        name: &str,
        group_id: Option<&str>,
        status: ComponentStatus,
    ) -> Result<ComponentId> {
        let group_id = group_id.and_then(|id| id.parse::<i64>().ok()).unwrap_or(0);
        let body = json!({
            "name": name,
            "status": status.code(),
            "component_group_id": group_id,
            "componentGroupId": group_id,
            "enabled": true,
            "visible": true,
        });

        let response = self
            .transport
            .post("components", &body, RetryPolicy::RateLimitOnly)
            .await?;
        let id = Self::created_id(&response, "component")?;
        info!("Component {} was created ({})", name, id);
        Ok(id)
    }

    async fn rename_component(&self, component_id: &str, name: &str) -> Result<()> {
        self.transport
            .put(&format!("components/{}", component_id), &json!({ "name": name }))
            .await?;
        info!("Component {} renamed to {}", component_id, name);
        Ok(())
    }

    async fn create_group(&self, name: &str) -> Result<GroupId> {
        let body = json!({ "name": name, "collapsed": 2, "visible": true });
        let response = self
            .transport
            .post("component-groups", &body, RetryPolicy::RateLimitOnly)
            .await?;
        let id = Self::created_id(&response, "component group")?;
        info!("Component Group {} was created ({})", name, id);
        Ok(id)
    }

    async fn list_components(&self) -> Result<Vec<Component>> {
        let items = self
            .get_all("components", &[("include", "group".to_string())])
            .await?;
        Ok(items.iter().map(parse_component).collect())
    }

    async fn list_groups(&self) -> Result<Vec<ComponentGroup>> {
        let items = self.get_all("component-groups", &[]).await?;
        Ok(items.iter().map(parse_group).collect())
    }

    async fn list_incidents(&self) -> Result<Vec<RemoteIncident>> {
        let items = self.get_all("incidents", &[]).await?;
        Ok(items.iter().map(parse_incident).collect())
    }
}

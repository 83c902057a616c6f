//! Monitoring side: the capability the reconcilers read from, and its Zabbix implementation

use crate::config::ZabbixConfig;
use crate::errors::{BridgeError, Result};
use crate::model::{Acknowledgement, Problem, Service, ServiceHealth, ServiceNode, ServiceTree, Severity};
use crate::transport::{HttpTransport, RetryPolicy, TransportOptions};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

/// Read-only view of the monitoring system
#[async_trait]
pub trait MonitoringClient: Send + Sync {
    async fn version(&self) -> Result<String>;

    /// Problems that are currently open
    async fn list_active_problems(&self) -> Result<Vec<Problem>>;

    /// Service forest below the service named `root`, or the whole forest
    async fn get_service_tree(&self, root: Option<&str>) -> Result<ServiceTree>;
}

/// Zabbix acknowledge action bits that produce a visible timeline entry
const ACTION_ACKNOWLEDGE: i64 = 2;
const ACTION_MESSAGE: i64 = 4;

const API_PATH: &str = "api_jsonrpc.php";

#[derive(Debug, Clone)]
enum Credentials {
    Token(String),
    Login { user: String, password: String },
}

/// Zabbix JSON-RPC client
#[derive(Debug)]
pub struct ZabbixClient {
    transport: HttpTransport,
    credentials: Credentials,
    request_id: AtomicU64,
}

impl ZabbixClient {
    pub fn new(config: &ZabbixConfig, options: TransportOptions) -> Result<Self> {
        let credentials = match config.token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => Credentials::Token(token.to_string()),
            None => Credentials::Login {
                user: config.user.clone(),
                password: config.password.clone(),
            },
        };

        Ok(Self {
            transport: HttpTransport::new(config.server.clone(), options)?,
            credentials,
            request_id: AtomicU64::new(1),
        })
    }

    pub fn transport(&self) -> &HttpTransport {
        &self.transport
    }

    /// Obtain (or install) the session token
    #[instrument(skip(self))]
    pub async fn login(&self) -> Result<()> {
        let token = match &self.credentials {
            Credentials::Token(token) => token.clone(),
            Credentials::Login { user, password } => {
                let result = self
                    .rpc(
                        &self.transport.anonymous(),
                        "user.login",
                        json!({ "username": user, "password": password }),
                    )
                    .await?;
                result
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| BridgeError::UpstreamProtocolError("user.login returned no token".into()))?
            }
        };
        self.transport.set_bearer_token(Some(token)).await;
        info!("Authenticated against Zabbix at {}", self.transport.base_url());
        Ok(())
    }

    /// Authenticated API call; logs in again once if the session expired
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self.rpc(&self.transport, method, params.clone()).await {
            Err(BridgeError::UpstreamRejected(msg)) if is_session_error(&msg) => {
                warn!("Zabbix session rejected ({}), logging in again", msg);
                self.login().await?;
                self.rpc(&self.transport, method, params).await
            }
            other => other,
        }
    }

    async fn rpc(&self, transport: &HttpTransport, method: &str, params: Value) -> Result<Value> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        debug!("Zabbix call {} (id {})", method, id);
        let response = transport
            .post(API_PATH, &body, RetryPolicy::Always)
            .await
            .map_err(read_side_error)?;

        if let Some(error) = response.get("error") {
            let message = format!(
                "{}: {} {}",
                method,
                error["message"].as_str().unwrap_or("error"),
                error["data"].as_str().unwrap_or("")
            );
            return Err(if is_session_error(&message) {
                BridgeError::UpstreamRejected(message)
            } else {
                BridgeError::UpstreamProtocolError(message)
            });
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| BridgeError::UpstreamProtocolError(format!("{}: response without result", method)))
    }
}

/// The monitoring side only reports unavailability or protocol errors
fn read_side_error(err: BridgeError) -> BridgeError {
    match err {
        BridgeError::RateLimited(msg) => BridgeError::UpstreamUnavailable(msg),
        BridgeError::UpstreamRejected(msg) => BridgeError::UpstreamProtocolError(msg),
        other => other,
    }
}

fn is_session_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("session terminated") || message.contains("not authorized") || message.contains("not authorised")
}

#[async_trait]
impl MonitoringClient for ZabbixClient {
    async fn version(&self) -> Result<String> {
        let result = self
            .rpc(&self.transport.anonymous(), "apiinfo.version", json!({}))
            .await?;
        Ok(result.as_str().unwrap_or_default().to_string())
    }

    #[instrument(skip(self))]
    async fn list_active_problems(&self) -> Result<Vec<Problem>> {
        let problems = self
            .call(
                "problem.get",
                json!({
                    "output": ["eventid", "objectid", "name", "severity", "clock", "acknowledged", "r_clock"],
                    "source": 0,
                    "object": 0,
                    "recent": false,
                    "sortfield": ["eventid"],
                }),
            )
            .await?;
        let problems = as_array(&problems, "problem.get")?;
        if problems.is_empty() {
            return Ok(Vec::new());
        }

        let event_ids: Vec<String> = problems.iter().map(|p| str_field(p, "eventid")).collect();
        let trigger_ids: Vec<String> = problems.iter().map(|p| str_field(p, "objectid")).collect();

        let events = self
            .call(
                "event.get",
                json!({
                    "eventids": event_ids,
                    "output": ["eventid"],
                    "select_acknowledges": "extend",
                }),
            )
            .await?;

        let triggers = self
            .call(
                "trigger.get",
                json!({
                    "triggerids": trigger_ids,
                    "output": ["triggerid", "description", "comments"],
                    "expandDescription": true,
                    "expandComment": true,
                }),
            )
            .await?;

        let services = self
            .call(
                "service.get",
                json!({
                    "output": ["serviceid"],
                    "selectProblemEvents": ["eventid"],
                }),
            )
            .await?;

        let problems = parse_problems(
            problems,
            as_array(&events, "event.get")?,
            as_array(&triggers, "trigger.get")?,
            as_array(&services, "service.get")?,
        );
        debug!("Zabbix reports {} active problems", problems.len());
        Ok(problems)
    }

    #[instrument(skip(self))]
    async fn get_service_tree(&self, root: Option<&str>) -> Result<ServiceTree> {
        let services = self
            .call(
                "service.get",
                json!({
                    "output": ["serviceid", "name", "status"],
                    "selectChildren": ["serviceid"],
                    "selectParents": ["serviceid"],
                }),
            )
            .await?;
        build_service_tree(as_array(&services, "service.get")?, root)
    }
}

fn as_array<'a>(value: &'a Value, method: &str) -> Result<&'a [Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| BridgeError::UpstreamProtocolError(format!("{}: expected an array", method)))
}

/// Zabbix sends most numbers as strings
fn str_field(value: &Value, key: &str) -> String {
    match &value[key] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn int_field(value: &Value, key: &str) -> Option<i64> {
    match &value[key] {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn time_field(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    int_field(value, key)
        .filter(|secs| *secs > 0)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn ids(value: &Value, key: &str) -> Vec<String> {
    value[key]
        .as_array()
        .map(|items| items.iter().map(|item| str_field(item, "serviceid")).collect())
        .unwrap_or_default()
}

fn acknowledgement_author(ack: &Value) -> String {
    let full_name = format!(
        "{} {}",
        ack["name"].as_str().unwrap_or(""),
        ack["surname"].as_str().unwrap_or("")
    );
    let full_name = full_name.trim();
    if !full_name.is_empty() {
        return full_name.to_string();
    }
    match ack["username"].as_str().or_else(|| ack["alias"].as_str()) {
        Some(username) if !username.is_empty() => username.to_string(),
        _ => format!("user {}", str_field(ack, "userid")),
    }
}

/// Join problem.get, event.get, trigger.get and service.get results into problems
pub fn parse_problems(
    problems: &[Value],
    events: &[Value],
    triggers: &[Value],
    services: &[Value],
) -> Vec<Problem> {
    let acknowledges: HashMap<String, &Value> = events
        .iter()
        .map(|event| (str_field(event, "eventid"), &event["acknowledges"]))
        .collect();

    let triggers: HashMap<String, &Value> = triggers
        .iter()
        .map(|trigger| (str_field(trigger, "triggerid"), trigger))
        .collect();

    let mut services_by_event: HashMap<String, Vec<String>> = HashMap::new();
    for service in services {
        let service_id = str_field(service, "serviceid");
        for event in service["problem_events"].as_array().into_iter().flatten() {
            services_by_event
                .entry(str_field(event, "eventid"))
                .or_default()
                .push(service_id.clone());
        }
    }

    problems
        .iter()
        .map(|raw| {
            let event_id = str_field(raw, "eventid");
            let trigger_id = str_field(raw, "objectid");
            let trigger = triggers.get(&trigger_id);

            let trigger_name = trigger
                .map(|t| str_field(t, "description"))
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| str_field(raw, "name"));
            let trigger_description = trigger.map(|t| str_field(t, "comments")).unwrap_or_default();

            let acknowledgements = acknowledges
                .get(&event_id)
                .and_then(|acks| acks.as_array())
                .into_iter()
                .flatten()
                .filter(|ack| {
                    let action = int_field(ack, "action").unwrap_or(ACTION_ACKNOWLEDGE);
                    action & (ACTION_ACKNOWLEDGE | ACTION_MESSAGE) != 0
                })
                .filter_map(|ack| {
                    Some(Acknowledgement {
                        author: acknowledgement_author(ack),
                        message: str_field(ack, "message"),
                        time: time_field(ack, "clock")?,
                    })
                })
                .collect();

            let mut service_ids = services_by_event.remove(&event_id).unwrap_or_default();
            service_ids.sort();
            service_ids.dedup();

            Problem {
                id: event_id,
                trigger_id,
                trigger_name,
                trigger_description,
                severity: Severity::from_zabbix(int_field(raw, "severity").unwrap_or(0)),
                service_ids,
                created_at: time_field(raw, "clock").unwrap_or_else(Utc::now),
                acknowledged: int_field(raw, "acknowledged") == Some(1),
                acknowledgements,
                resolved_at: time_field(raw, "r_clock"),
            }
        })
        .filter(|problem| problem.resolved_at.is_none())
        .collect()
}

/// Build the service forest from a flat service.get result
pub fn build_service_tree(services: &[Value], root: Option<&str>) -> Result<ServiceTree> {
    let by_id: HashMap<String, &Value> = services
        .iter()
        .map(|service| (str_field(service, "serviceid"), service))
        .collect();

    let mut top: Vec<String> = match root {
        Some(root_name) => {
            let root = services
                .iter()
                .find(|service| service["name"].as_str() == Some(root_name))
                .ok_or_else(|| {
                    BridgeError::UpstreamProtocolError(format!("cannot find service `{}` in Zabbix", root_name))
                })?;
            ids(root, "children")
        }
        None => services
            .iter()
            .filter(|service| ids(service, "parents").is_empty())
            .map(|service| str_field(service, "serviceid"))
            .collect(),
    };
    top.sort();

    let mut path = HashSet::new();
    let nodes = top
        .iter()
        .filter_map(|id| build_node(id, &by_id, &mut path))
        .collect();
    Ok(ServiceTree::new(nodes))
}

fn build_node(id: &str, by_id: &HashMap<String, &Value>, path: &mut HashSet<String>) -> Option<ServiceNode> {
    let raw = by_id.get(id)?;
    if !path.insert(id.to_string()) {
        warn!("Service {} is its own ancestor, skipping", id);
        return None;
    }

    let mut child_ids = ids(raw, "children");
    child_ids.sort();
    let children = child_ids
        .iter()
        .filter_map(|child| build_node(child, by_id, path))
        .collect();
    path.remove(id);

    let service = Service {
        id: id.to_string(),
        name: str_field(raw, "name"),
        parent_ids: ids(raw, "parents"),
        health: ServiceHealth::from_zabbix(int_field(raw, "status").unwrap_or(-1)),
    };
    Some(ServiceNode::with_children(service, children))
}

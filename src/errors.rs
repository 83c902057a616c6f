//! Error types for the Zabbix to Cachet bridge

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Remote side could not be reached (network failure, timeout, 5xx)
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Remote side answered with something we could not interpret
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    /// Remote side refused the request (validation error, conflict, auth)
    #[error("upstream rejected request: {0}")]
    UpstreamRejected(String),

    /// Remote side asked us to slow down
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// None of a problem's services has a status page component yet
    #[error("no component mapped for services {0:?}")]
    UnmappedService(Vec<String>),

    /// Template references a field outside its documented set, or is malformed
    #[error("template `{template}`: {reason}")]
    TemplateField { template: String, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl BridgeError {
    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::UpstreamUnavailable(_) | BridgeError::RateLimited(_)
        )
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BridgeError::UpstreamProtocolError(err.to_string())
        } else if err.is_builder() {
            BridgeError::Config(err.to_string())
        } else {
            BridgeError::UpstreamUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::UpstreamProtocolError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::UpstreamUnavailable("timeout".into()).is_retryable());
        assert!(BridgeError::RateLimited("429".into()).is_retryable());
        assert!(!BridgeError::UpstreamRejected("422".into()).is_retryable());
        assert!(!BridgeError::UnmappedService(vec!["7".into()]).is_retryable());
    }

    #[test]
    fn test_json_error_is_protocol_error() {
        let err: BridgeError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, BridgeError::UpstreamProtocolError(_)));
    }
}

//! Fire-and-forget failure reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tara_recognize::ModelLoadError;
use tracing::{debug, warn};

use crate::{APP_NAME, VERSION};

/// What gets posted when the local model could not be obtained.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub message: String,
    pub kind: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
    /// Whether any mirror answered the existence check
    pub online: bool,
}

impl FailureReport {
    pub fn model_load(error: &ModelLoadError, online: bool) -> Self {
        Self {
            message: error.to_string(),
            kind: error.class().name().to_string(),
            user_agent: user_agent(),
            timestamp: Utc::now(),
            online,
        }
    }
}

fn user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        APP_NAME,
        VERSION,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Posts [`FailureReport`]s as JSON. No retries; failures are only logged.
#[derive(Debug, Clone)]
pub struct DiagnosticsClient {
    client: reqwest::Client,
    endpoint: String,
}

impl DiagnosticsClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Sends the report in the background.
    pub fn report(&self, report: FailureReport) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&report).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(endpoint, "Failure report delivered");
                }
                Ok(response) => {
                    warn!(endpoint, status = %response.status(), "Failure report rejected");
                }
                Err(e) => {
                    warn!(endpoint, error = %e, "Failed to send failure report");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_fields() {
        let report = FailureReport::model_load(&ModelLoadError::Timeout, true);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["message"], "model download timed out");
        assert_eq!(json["online"], true);
        assert!(json["user_agent"].as_str().unwrap().starts_with("tara/"));

        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_network_errors_are_classified() {
        let report = FailureReport::model_load(&ModelLoadError::Network("refused".into()), false);
        assert_eq!(report.kind, "network");
        assert!(!report.online);
    }
}

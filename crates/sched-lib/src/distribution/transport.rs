//! Delivery of intent batches to scheduling agents

use crate::models::{AgentPod, Intent, IntentBatch};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Path of the agent intake endpoint
pub const INTENTS_PATH: &str = "/api/v1/intents";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid agent address {endpoint}: {source}")]
    InvalidAddress {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request to agent {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("agent {endpoint} returned non-OK status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
}

/// Delivers one batch to one agent; no partial acknowledgement
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn send_intents(&self, agent: &AgentPod, intents: &[Intent]) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub request_timeout: Duration,
    /// Used when the agent pod declares no port
    pub default_port: u16,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            default_port: 8082,
        }
    }
}

/// JSON-over-HTTP transport to the agent intake endpoint
#[derive(Clone)]
pub struct HttpAgentTransport {
    client: Client,
    default_port: u16,
}

impl HttpAgentTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            default_port: config.default_port,
        })
    }

    /// Intake URL for an agent; IPv6 hosts are bracketed
    pub fn intake_url(&self, agent: &AgentPod) -> Result<Url, TransportError> {
        let port = if agent.port == 0 {
            self.default_port
        } else {
            agent.port
        };
        let host = if agent.host.contains(':') && !agent.host.starts_with('[') {
            format!("[{}]", agent.host)
        } else {
            agent.host.clone()
        };

        let endpoint = format!("http://{}:{}", host, port);
        Url::parse(&endpoint)
            .and_then(|base| base.join(INTENTS_PATH))
            .map_err(|source| TransportError::InvalidAddress { endpoint, source })
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn send_intents(&self, agent: &AgentPod, intents: &[Intent]) -> Result<(), TransportError> {
        let url = self.intake_url(agent)?;
        let endpoint = agent.endpoint();
        debug!(
            agent = %agent,
            intents = intents.len(),
            "Sending scheduling intents to agent"
        );

        let response = self
            .client
            .post(url)
            .json(&IntentBatch::from_intents(intents))
            .send()
            .await
            .map_err(|source| TransportError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentState;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    fn agent(host: &str, port: u16) -> AgentPod {
        AgentPod {
            node_id: "node-a".to_string(),
            host: host.to_string(),
            port,
            state: AgentState::Online,
        }
    }

    #[test]
    fn test_intake_url() {
        let transport = HttpAgentTransport::new(HttpTransportConfig::default()).unwrap();

        let url = transport.intake_url(&agent("10.0.0.5", 9000)).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:9000/api/v1/intents");

        let url = transport.intake_url(&agent("10.0.0.5", 0)).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.5:8082/api/v1/intents");

        let url = transport.intake_url(&agent("fd00::5", 9000)).unwrap();
        assert_eq!(url.as_str(), "http://[fd00::5]:9000/api/v1/intents");
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_send_posts_batch() {
        let received: Arc<Mutex<Vec<IntentBatch>>> = Arc::default();
        let sink = Arc::clone(&received);
        let router = Router::new().route(
            INTENTS_PATH,
            post(move |Json(batch): Json<IntentBatch>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(batch);
                    StatusCode::OK
                }
            }),
        );
        let port = serve(router).await;

        let transport = HttpAgentTransport::new(HttpTransportConfig::default()).unwrap();
        let strategy = crate::models::Strategy::create(uuid::Uuid::new_v4(), Default::default());
        let pod = crate::models::Pod {
            namespace: "default".to_string(),
            labels: Default::default(),
            pod_id: "uid-1".to_string(),
            node_id: "node-a".to_string(),
            containers: vec![],
        };
        let intents = vec![Intent::for_pod(&strategy, &pod)];

        transport
            .send_intents(&agent("127.0.0.1", port), &intents)
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].intents[0].pod_id, "uid-1");
    }

    #[tokio::test]
    async fn test_non_success_status_is_error() {
        let router = Router::new().route(
            INTENTS_PATH,
            post(|| async { (StatusCode::BAD_REQUEST, "bad payload") }),
        );
        let port = serve(router).await;

        let transport = HttpAgentTransport::new(HttpTransportConfig::default()).unwrap();
        let err = transport
            .send_intents(&agent("127.0.0.1", port), &[])
            .await
            .unwrap_err();

        match err {
            TransportError::Status { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad payload");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}

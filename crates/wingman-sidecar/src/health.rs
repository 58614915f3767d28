use crate::config::SidecarConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Something answered on the port but it is not our worker, or it is unwell.
    Foreign { status: u16 },
    Unreachable(TransportError),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Cheap reachability check, kept separate from functional requests.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> HealthStatus;
}

/// `GET /health` with a short timeout. Healthy only when the body carries the
/// service marker; a bare 200 from some other listener does not count.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    marker: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client, config: &SidecarConfig) -> Self {
        Self {
            client,
            url: config.health_url(),
            marker: config.service_marker.clone(),
            timeout: config.health_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> HealthStatus {
        let response = match self.client.get(&self.url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                let transport = TransportError::from_reqwest(&e);
                tracing::debug!("Health probe {} failed: {}", self.url, transport);
                return HealthStatus::Unreachable(transport);
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return HealthStatus::Unreachable(TransportError::from_reqwest(&e)),
        };

        if status.is_success() && body.contains(&self.marker) {
            HealthStatus::Healthy
        } else {
            tracing::debug!(
                "Health probe {} answered {} without service marker",
                self.url,
                status
            );
            HealthStatus::Foreign {
                status: status.as_u16(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use crate::test_support::{closed_port, spawn_canned_server, Route, HEALTHY_BODY};

    fn probe_for(base_url: &str) -> HttpHealthProbe {
        let port = base_url.rsplit(':').next().unwrap().parse().unwrap();
        let config = SidecarConfig {
            port,
            ..SidecarConfig::default()
        };
        HttpHealthProbe::new(reqwest::Client::new(), &config)
    }

    #[tokio::test]
    async fn marker_in_body_is_healthy() {
        let server = spawn_canned_server(vec![Route::json(
            "/health",
            "200 OK",
            HEALTHY_BODY,
        )])
        .await;
        assert_eq!(probe_for(&server.base_url).probe().await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn plain_200_from_foreign_listener_is_not_healthy() {
        let server =
            spawn_canned_server(vec![Route::json("/health", "200 OK", r#"{"ok":true}"#)]).await;
        assert_eq!(
            probe_for(&server.base_url).probe().await,
            HealthStatus::Foreign { status: 200 }
        );
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let port = closed_port();
        match probe_for(&format!("http://127.0.0.1:{port}")).probe().await {
            HealthStatus::Unreachable(e) => {
                assert_eq!(e.kind, TransportErrorKind::ConnectionRefused)
            }
            other => panic!("expected unreachable, got {other:?}"),
        }
    }
}

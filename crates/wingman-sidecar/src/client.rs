// Sidecar HTTP client
// Health-gated requests with bounded, escalating retries and typed error mapping.

use crate::classify::is_recoverable;
use crate::config::SidecarConfig;
use crate::delay::{Delay, TokioDelay};
use crate::error::{Result, SidecarError, TransportError, TransportErrorKind};
use crate::health::{HealthProbe, HealthStatus, HttpHealthProbe};
use crate::lifecycle::{SidecarLauncher, StartOutcome};
use crate::retry::{poll_until, retry, PollOutcome, RetryError, RetryPolicy};
use crate::stream::{event_stream, EventStream};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use wingman_observability::{describe_body, emit_event, ObservabilityEvent, ProcessKind};
use wingman_wire::{
    AuthTokenRequest, AuthTokenResponse, DeviceAuthPollRequest, DeviceAuthPollResponse,
    DeviceAuthStartRequest, DeviceAuthStartResponse, ErrorEnvelope, PromptRequest,
};

pub struct SidecarClient {
    config: SidecarConfig,
    base_url: String,
    http: Client,
    /// No overall timeout; streams are bounded per chunk instead.
    stream_http: Client,
    health: Arc<dyn HealthProbe>,
    launcher: Arc<dyn SidecarLauncher>,
    delay: Arc<dyn Delay>,
}

impl SidecarClient {
    pub fn new(config: SidecarConfig, launcher: Arc<dyn SidecarLauncher>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| SidecarError::Config(format!("Failed to create HTTP client: {e}")))?;
        let stream_http = Client::builder()
            .http1_only()
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| SidecarError::Config(format!("Failed to create stream client: {e}")))?;
        let health = Arc::new(HttpHealthProbe::new(http.clone(), &config));

        Ok(Self {
            base_url: config.base_url(),
            config,
            http,
            stream_http,
            health,
            launcher,
            delay: Arc::new(TokioDelay),
        })
    }

    pub fn with_health_probe(mut self, health: Arc<dyn HealthProbe>) -> Self {
        self.health = health;
        self
    }

    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> HealthStatus {
        self.health.probe().await
    }

    /// Probe, start if needed, then poll health. `Ok(false)` means the worker
    /// is still not healthy and the caller should proceed and let the real
    /// request report what is wrong.
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<bool> {
        if self.health.probe().await.is_healthy() {
            return Ok(true);
        }
        match self.launcher.start_if_needed().await {
            outcome @ (StartOutcome::Unresolved { .. } | StartOutcome::SpawnFailed { .. }) => {
                tracing::warn!("Sidecar could not be started: {:?}", outcome)
            }
            outcome => tracing::debug!("Sidecar start: {:?}", outcome),
        }
        self.wait_for_health(cancel).await
    }

    // ------------------------------------------------------------------
    // Typed endpoints
    // ------------------------------------------------------------------

    pub async fn authenticate(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<AuthTokenResponse> {
        let body = AuthTokenRequest {
            token: token.to_string(),
        };
        self.send_json(Method::POST, "/auth", Some(&body), self.config.auth_max_attempts, cancel)
            .await
    }

    pub async fn start_device_auth(
        &self,
        client_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DeviceAuthStartResponse> {
        let body = DeviceAuthStartRequest {
            client_id: client_id.to_string(),
        };
        self.send_json(
            Method::POST,
            "/auth/start",
            Some(&body),
            self.config.auth_max_attempts,
            cancel,
        )
        .await
    }

    pub async fn poll_device_auth(
        &self,
        client_id: &str,
        device_code: &str,
        cancel: &CancellationToken,
    ) -> Result<DeviceAuthPollResponse> {
        let body = DeviceAuthPollRequest {
            client_id: client_id.to_string(),
            device_code: device_code.to_string(),
        };
        self.send_json(
            Method::POST,
            "/auth/poll",
            Some(&body),
            self.config.auth_max_attempts,
            cancel,
        )
        .await
    }

    pub async fn prompt_stream(
        &self,
        request: &PromptRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        self.open_stream("/prompt", request, cancel).await
    }

    // ------------------------------------------------------------------
    // Generic requests
    // ------------------------------------------------------------------

    pub async fn get_json<Resp: DeserializeOwned>(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<Resp> {
        self.send_json::<(), Resp>(Method::GET, path, None, self.config.max_attempts, cancel)
            .await
    }

    pub async fn post_json<Req, Resp>(
        &self,
        path: &str,
        body: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.send_json(Method::POST, path, Some(body), self.config.max_attempts, cancel)
            .await
    }

    /// Opens an SSE stream. Retries cover connecting and the response head;
    /// once the stream is handed out, errors end it instead.
    pub async fn open_stream<Req: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &Req,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let url = self.url(path);
        let payload = serde_json::to_vec(body)?;
        let idle_timeout = self.config.stream_timeout;

        let response = self
            .execute(path, self.config.max_attempts, &cancel, |attempt| {
                let request = self
                    .stream_http
                    .post(&url)
                    .header(CONTENT_TYPE, "application/json")
                    .header(ACCEPT, "text/event-stream")
                    .body(payload.clone());
                async move {
                    tracing::debug!("Opening stream {} (attempt {})", path, attempt);
                    let response = match tokio::time::timeout(idle_timeout, request.send()).await {
                        Ok(sent) => sent?,
                        Err(_) => {
                            return Err(SidecarError::Transport(TransportError::new(
                                TransportErrorKind::TimedOut,
                                format!("no response from {path} within {}s", idle_timeout.as_secs()),
                            )))
                        }
                    };
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        return Ok(response);
                    }
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(
                        "Stream request to {} failed ({}): {}",
                        path,
                        status,
                        describe_body(&body, self.config.log_http_bodies)
                    );
                    Err(error_for_status(path, status, &body))
                }
            })
            .await?;

        Ok(event_stream(response.bytes_stream(), idle_timeout, cancel))
    }

    async fn send_json<Req, Resp>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Req>,
        budget: u32,
        cancel: &CancellationToken,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.url(path);
        let payload = body.map(serde_json::to_vec).transpose()?;
        let method_name = method.as_str();

        self.execute(path, budget, cancel, |attempt| {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .timeout(self.config.request_timeout);
            if let Some(payload) = payload.as_ref() {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(payload.clone());
            }
            async move {
                tracing::debug!("{} {} (attempt {})", method_name, path, attempt);
                let response = request.send().await?;
                let status = response.status().as_u16();
                let body = response.text().await?;
                let verbose = self.config.log_http_bodies;
                tracing::debug!("{} -> {}: {}", path, status, describe_body(&body, verbose));
                decode_body(path, status, &body, verbose)
            }
        })
        .await
    }

    /// Health gate, then the retry loop with escalation between attempts.
    async fn execute<T, Op, Fut>(
        &self,
        path: &str,
        budget: u32,
        cancel: &CancellationToken,
        operation: Op,
    ) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(SidecarError::Cancelled);
        }
        if !self.ensure_ready(cancel).await? {
            tracing::warn!("Sidecar still unhealthy before {}; sending anyway", path);
        }

        let policy = RetryPolicy::fixed(budget, Duration::ZERO)
            .retry_if(|error: &SidecarError, _| is_recoverable(error));
        let outcome = retry(
            &policy,
            self.delay.as_ref(),
            cancel,
            operation,
            |attempt: u32, error: &SidecarError| {
                let detail = error.to_string();
                self.escalate(path, attempt, detail, cancel)
            },
        )
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(SidecarError::Cancelled),
            Err(RetryError::Failed { error, attempts }) if is_recoverable(&error) => {
                let detail = error.to_string();
                tracing::error!(
                    "Sidecar unreachable for {} after {} attempts: {}",
                    path,
                    attempts,
                    detail
                );
                emit_event(
                    Level::ERROR,
                    ProcessKind::Host,
                    ObservabilityEvent {
                        event: "http.not_ready",
                        component: "sidecar.client",
                        attempt: Some(attempts),
                        status: Some("failed"),
                        error_code: transport_code(&error),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                Err(SidecarError::NotReady(detail))
            }
            Err(RetryError::Failed { error, .. }) => Err(error),
        }
    }

    /// First retry only waits for health; later ones restart the worker first.
    async fn escalate(&self, path: &str, attempt: u32, detail: String, cancel: &CancellationToken) {
        let restart = attempt > 1;
        tracing::warn!(
            "{} failed on attempt {}: {}; {}",
            path,
            attempt,
            detail,
            if restart {
                "restarting sidecar"
            } else {
                "waiting for sidecar"
            }
        );
        emit_event(
            Level::WARN,
            ProcessKind::Host,
            ObservabilityEvent {
                event: "http.retry",
                component: "sidecar.client",
                attempt: Some(attempt),
                status: Some(if restart { "restart" } else { "wait" }),
                detail: Some(&detail),
                ..Default::default()
            },
        );

        if restart {
            let outcome = self.launcher.restart().await;
            tracing::debug!("Sidecar restart: {:?}", outcome);
        }
        if let Err(e) = self.wait_for_health(cancel).await {
            tracing::debug!("Health wait aborted: {}", e);
        }
    }

    async fn wait_for_health(&self, cancel: &CancellationToken) -> Result<bool> {
        let health = self.health.clone();
        let outcome = poll_until(
            self.config.health_poll_attempts,
            self.config.health_poll_interval,
            self.delay.as_ref(),
            cancel,
            |_| {
                let health = health.clone();
                async move { health.probe().await }
            },
            HealthStatus::is_healthy,
        )
        .await;
        match outcome {
            PollOutcome::Ready(_) => Ok(true),
            PollOutcome::Exhausted(last) => {
                tracing::debug!("Sidecar not healthy after polling: {:?}", last);
                Ok(false)
            }
            PollOutcome::Cancelled => Err(SidecarError::Cancelled),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn transport_code(error: &SidecarError) -> Option<&'static str> {
    match error {
        SidecarError::Transport(t) | SidecarError::StreamInterrupted(t) => Some(t.kind.as_str()),
        _ => None,
    }
}

/// 2xx bodies decode into `T`; anything else becomes a typed error.
pub(crate) fn decode_body<T: DeserializeOwned>(
    path: &str,
    status: u16,
    body: &str,
    verbose: bool,
) -> Result<T> {
    if !(200..300).contains(&status) {
        tracing::warn!(
            "Request to {} failed ({}): {}",
            path,
            status,
            describe_body(body, verbose)
        );
        return Err(error_for_status(path, status, body));
    }
    serde_json::from_str(body).map_err(|e| {
        tracing::error!(
            "Failed to parse response from {}: {} (body: {})",
            path,
            e,
            describe_body(body, verbose)
        );
        SidecarError::UnexpectedResponse(format!("{path}: {e}"))
    })
}

pub(crate) fn error_for_status(path: &str, status: u16, body: &str) -> SidecarError {
    if status == 404 {
        return SidecarError::StaleVersion(path.to_string());
    }
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.trim().is_empty() => SidecarError::Api {
            status,
            message: envelope.error,
        },
        _ => SidecarError::Http { status },
    }
}

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wingman_observability::{default_logs_dir, emit_event, init_process_logging, ObservabilityEvent, ProcessKind};
use wingman_sidecar::{
    resolve_script, HealthStatus, PortInspector, SidecarClient, SidecarConfig, SidecarError,
    SidecarLifecycle, StreamEvent, SystemPortInspector,
};
use wingman_wire::PromptRequest;

#[derive(Parser, Debug)]
#[command(name = "wingman-host")]
#[command(about = "Start, check and talk to the Wingman sidecar")]
struct Cli {
    #[arg(long, env = "WINGMAN_SIDECAR_PORT")]
    port: Option<u16>,
    /// Directory holding `sidecar/` and `runtime/` from the app bundle.
    #[arg(long, env = "WINGMAN_RESOURCE_DIR")]
    resource_dir: Option<PathBuf>,
    #[arg(long, env = "WINGMAN_NODE_PATH")]
    node: Option<PathBuf>,
    #[arg(long)]
    logs_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 14)]
    log_retention_days: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the well-known port.
    Health,
    /// Start the sidecar (or reuse a healthy one) and supervise it until Ctrl-C.
    Start,
    /// Stop a sidecar listening on the port that runs our entry script.
    Stop,
    Auth {
        #[arg(long, env = "WINGMAN_GITHUB_TOKEN", hide_env_values = true)]
        token: String,
    },
    DeviceLogin {
        #[arg(long, env = "WINGMAN_OAUTH_CLIENT_ID")]
        client_id: String,
    },
    Prompt {
        prompt: String,
        #[arg(long, default_value = "cli")]
        chat_id: String,
        #[arg(long)]
        project: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logs_dir = cli.logs_dir.clone().unwrap_or_else(default_logs_dir);
    let (_log_guard, log_info) =
        init_process_logging(ProcessKind::Host, &logs_dir, cli.log_retention_days)?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Host,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "host.main",
            status: Some("ok"),
            detail: Some("host jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("host logging initialized: {:?}", log_info);

    let config = build_config(&cli);
    let lifecycle = Arc::new(SidecarLifecycle::new(config.clone()));
    let client = SidecarClient::new(config.clone(), lifecycle.clone())?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Command::Health => match client.health().await {
            HealthStatus::Healthy => println!("healthy ({})", client.base_url()),
            HealthStatus::Foreign { status } => {
                bail!("port {} is served by something else (HTTP {status})", config.port)
            }
            HealthStatus::Unreachable(e) => bail!("sidecar unreachable: {e}"),
        },
        Command::Start => {
            let outcome = lifecycle.start_if_needed().await;
            if !outcome.is_serving() {
                bail!("sidecar did not start: {outcome:?}");
            }
            match client.ensure_ready(&cancel).await {
                Ok(true) => {}
                Ok(false) => warn!("Sidecar started but is not healthy yet"),
                Err(SidecarError::Cancelled) => {}
                Err(e) => return Err(e.into()),
            }
            println!("{}", serde_json::to_string_pretty(&lifecycle.snapshot())?);
            cancel.cancelled().await;
            if let Some(pid) = lifecycle.stop().await {
                info!("Stopped sidecar (pid {})", pid);
            }
        }
        Command::Stop => stop_listener(&config).await?,
        Command::Auth { token } => {
            let response = client
                .authenticate(&token, &cancel)
                .await
                .map_err(user_error)?;
            if response.authenticated == Some(false) || !response.ok {
                bail!("token was not accepted");
            }
            println!("Authenticated.");
        }
        Command::DeviceLogin { client_id } => device_login(&client, &client_id, &cancel).await?,
        Command::Prompt {
            prompt,
            chat_id,
            project,
            model,
        } => {
            let project = match project {
                Some(project) => project,
                None => std::env::current_dir().context("cannot read current directory")?,
            };
            let mut request = PromptRequest::new(prompt, chat_id, project.display().to_string());
            if let Some(model) = model {
                request = request.with_model(model);
            }
            print_stream(&client, &request, cancel).await?;
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> SidecarConfig {
    let mut config = SidecarConfig::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.resource_dir.is_some() {
        config.resource_dir = cli.resource_dir.clone();
    }
    if cli.node.is_some() {
        config.runtime_override = cli.node.clone();
    }
    config
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            cancel.cancel();
        }
    });
}

/// Full error to the log, stable wording to the terminal.
fn user_error(err: SidecarError) -> anyhow::Error {
    tracing::error!("{}", err);
    anyhow::anyhow!(err.user_message())
}

async fn stop_listener(config: &SidecarConfig) -> anyhow::Result<()> {
    let Some(script) = resolve_script(config) else {
        bail!("sidecar entry script {} not found", config.script_name);
    };
    let script = script.display().to_string();
    let inspector = SystemPortInspector;
    let ours: Vec<_> = inspector
        .listeners(config.port)
        .await
        .into_iter()
        .filter(|listener| listener.command.contains(&script))
        .collect();

    if ours.is_empty() {
        println!("No sidecar listening on port {}", config.port);
        return Ok(());
    }
    for listener in ours {
        inspector
            .terminate(listener.pid)
            .with_context(|| format!("failed to stop pid {}", listener.pid))?;
        println!("Stopped pid {}", listener.pid);
    }
    Ok(())
}

async fn device_login(
    client: &SidecarClient,
    client_id: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let start = client
        .start_device_auth(client_id, cancel)
        .await
        .map_err(user_error)?;
    println!(
        "Open {} and enter code {}",
        start
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&start.verification_uri),
        start.user_code
    );

    let mut interval = Duration::from_secs(start.interval.unwrap_or(5).max(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => bail!("device login cancelled"),
            _ = tokio::time::sleep(interval) => {}
        }
        let poll = client
            .poll_device_auth(client_id, &start.device_code, cancel)
            .await
            .map_err(user_error)?;
        if poll.is_complete() {
            println!("Signed in.");
            return Ok(());
        }
        match poll.status.as_str() {
            "slow_down" => interval += Duration::from_secs(5),
            "expired" | "expired_token" | "access_denied" | "denied" => {
                bail!("device login {}", poll.status)
            }
            _ => {}
        }
        if let Some(secs) = poll.interval {
            interval = interval.max(Duration::from_secs(secs));
        }
    }
}

async fn print_stream(
    client: &SidecarClient,
    request: &PromptRequest,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut events = client
        .prompt_stream(request, cancel)
        .await
        .map_err(user_error)?;
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event.map_err(user_error)? {
            StreamEvent::TextDelta(text) => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            StreamEvent::Status(label) => eprintln!("[{label}]"),
            StreamEvent::ToolExecution(tool) => eprintln!(
                "[{} {}]",
                tool.tool_name,
                if tool.success { "ok" } else { "failed" }
            ),
            StreamEvent::Error(message) => eprintln!("error: {message}"),
            StreamEvent::Completed => break,
        }
    }
    writeln!(stdout)?;
    Ok(())
}

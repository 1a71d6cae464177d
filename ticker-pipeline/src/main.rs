use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use axum::http::StatusCode;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use ticker_core::{ApplicationProperties, PipelineConfig};
use ticker_pipeline::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "ticker", version, about = "Windowed ticker price aggregation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline from a pipeline.toml or an application properties file
    Run {
        #[arg(short, long, conflicts_with = "properties", required_unless_present = "properties")]
        config: Option<PathBuf>,
        /// JSON object of property groups, e.g. {"OutputStream0": {"stream.name": "..."}}
        #[arg(long)]
        properties: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
}

fn app() -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
}

async fn metrics() -> String {
    ticker_core::metrics::render_prometheus()
}

async fn healthz() -> (StatusCode, &'static str) {
    if ticker_core::metrics::PIPELINE_HEALTHY.get() == 1 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    }
}

async fn serve(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("serving /metrics on {}", addr);
    Ok(listener)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let listener = serve(port).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run {
            config,
            properties,
            http_port,
        } => {
            let cfg = load_config(config.as_deref(), properties.as_deref()).await?;
            if http_port != 0 {
                let listener = serve(http_port).await?;
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app()).await;
                });
            }
            run_pipeline(cfg).await
        }
    }
}

async fn load_config(config: Option<&Path>, properties: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match (config, properties) {
        (Some(path), _) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(PipelineConfig::from_toml_str(&text)?)
        }
        (None, Some(path)) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(config_from_properties_json(&text)?)
        }
        (None, None) => anyhow::bail!("either --config or --properties is required"),
    }
}

fn config_from_properties_json(text: &str) -> ticker_core::Result<PipelineConfig> {
    let props: ApplicationProperties = serde_json::from_str(text)?;
    PipelineConfig::from_properties(&props)
}

async fn run_pipeline(cfg: PipelineConfig) -> anyhow::Result<()> {
    let report = Pipeline::new(cfg)?
        .run(async {
            if tokio::signal::ctrl_c().await.is_err() {
                // no signal handler available, run until the generator ends
                std::future::pending::<()>().await;
            }
        })
        .await?;
    tracing::info!(
        events = report.events_generated,
        results = report.results_emitted(),
        checkpoints = report.checkpoints_completed,
        "run report"
    );
    if !report.is_healthy() {
        anyhow::bail!(
            "lanes {:?} halted after sustained sink failures; {} events dropped",
            report.halted_lanes,
            report.dropped_events
        );
    }
    Ok(())
}

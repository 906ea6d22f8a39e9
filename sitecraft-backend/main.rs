mod api;
mod apply;
mod config;
mod preview;
mod sandbox;
mod sessions;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use clap::Parser;
use dotenvy::dotenv;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::apply::checkpoint::CheckpointLog;
use crate::apply::events::{EventSink, GenerationSource, LiveSource, ResponseSource};
use crate::apply::transcript::Transcript;
use crate::apply::{ApplyEngine, ApplyPolicy, ApplyRequest};
use crate::config::Config;
use crate::preview::{HttpProbe, ReadinessPolicy};
use crate::sessions::SessionRegistry;

#[derive(Parser)]
#[command(name = "sitecraft", about = "Sandbox sessions and live code apply for generated apps")]
enum Cli {
    /// Start the HTTP server (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
    /// Apply a model response to a session
    Apply {
        /// File holding the model response with <file> blocks, or `-` for stdin
        #[arg(long)]
        file: PathBuf,
        /// Read the input as a live stream of NDJSON or SSE generation
        /// envelopes and apply files as they complete
        #[arg(long)]
        stream: bool,
        /// Session to apply to; a new one is provisioned when omitted
        #[arg(long)]
        session: Option<String>,
        /// Extra packages to install
        #[arg(long = "package")]
        packages: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Default to Serve when no subcommand is given, but keep --help working.
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 { Cli::Serve } else { Cli::parse() };

    init_tracing();
    let config = Config::from_env();
    let _guard = init_sentry(&config);
    config.log_warnings();

    match cli {
        Cli::Serve => run_server(config).await,
        Cli::Apply {
            file,
            stream,
            session,
            packages,
        } => run_apply(config, file, stream, session, packages).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sitecraft=info,tower_http=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();
}

fn init_sentry(config: &Config) -> sentry::ClientInitGuard {
    sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            send_default_pii: true,
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ))
}

fn build_engine(config: &Config) -> (SessionRegistry, CheckpointLog, Arc<ApplyEngine>) {
    let factory = sandbox::build_provider_factory(config);
    let registry = SessionRegistry::new(factory);
    let checkpoints = CheckpointLog::new();
    let engine = Arc::new(ApplyEngine::new(
        registry.clone(),
        checkpoints.clone(),
        ApplyPolicy::default(),
    ));
    (registry, checkpoints, engine)
}

async fn run_server(config: Config) -> Result<()> {
    let (registry, checkpoints, engine) = build_engine(&config);
    let probe = HttpProbe::new(Duration::from_secs(5)).context("failed to build preview probe client")?;

    let port = config.port;
    let app_state = api::AppState {
        config: Arc::new(config),
        registry: registry.clone(),
        engine,
        checkpoints: checkpoints.clone(),
        probe: Arc::new(probe),
        readiness: ReadinessPolicy::default(),
    };

    let app = api::create_app(app_state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!("Listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for id in registry.session_ids().await {
        if let Err(e) = registry.terminate_session(&id).await {
            tracing::warn!(session_id = %id, error = %e, "failed to terminate session on shutdown");
        }
        checkpoints.remove(&id).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

async fn run_apply(
    config: Config,
    file: PathBuf,
    stream: bool,
    session: Option<String>,
    packages: Vec<String>,
) -> Result<()> {
    let from_stdin = file.as_os_str() == "-";
    let source: Box<dyn GenerationSource> = if stream {
        let reader: Box<dyn AsyncRead + Send + Unpin> = if from_stdin {
            Box::new(tokio::io::stdin())
        } else {
            Box::new(
                tokio::fs::File::open(&file)
                    .await
                    .with_context(|| format!("failed to open {}", file.display()))?,
            )
        };
        Box::new(LiveSource::from_bytes(ReaderStream::new(reader)))
    } else {
        let response = if from_stdin {
            let mut response = String::new();
            tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut response)
                .await
                .context("failed to read response from stdin")?;
            response
        } else {
            tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?
        };
        Box::new(ResponseSource::new(response, Vec::new()))
    };
    let (_registry, _checkpoints, engine) = build_engine(&config);

    let (sink, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        let mut transcript = Transcript::new();
        while let Some(event) = rx.recv().await {
            if let Some(line) = transcript.apply(&event) {
                eprintln!("{line}");
            }
        }
    });

    let request = ApplyRequest {
        session_hint: session,
        packages,
        ..ApplyRequest::default()
    };
    let outcome = engine
        .apply_generated_output(source.as_ref(), request, &sink)
        .await;
    drop(sink);
    printer.await.context("progress printer panicked")?;

    let result = outcome.context("apply failed")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("failed to encode apply result")?
    );
    Ok(())
}

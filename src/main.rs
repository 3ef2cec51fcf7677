use anyhow::Context;
use arkivgist::archive::DocumentKey;
use arkivgist::pipeline::{EnrichmentPipeline, PipelineResult};
use arkivgist::{api, config, logging};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "arkivgist", version, about = "Summarize archived case decisions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API (default).
    Serve,
    /// Process one case folder and print results as NDJSON on stdout.
    Run {
        #[arg(long)]
        group: u32,
        #[arg(long)]
        subgroup: u32,
        #[arg(long)]
        section: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Run {
            group,
            subgroup,
            section,
        } => run_once(DocumentKey::new(group, subgroup, section)).await,
    }
}

async fn serve() -> anyhow::Result<()> {
    config::init_config();
    logging::init_tracing();
    let pipeline = EnrichmentPipeline::from_config(config::get_config())?;
    let app = api::create_router(Arc::new(pipeline));

    let (listener, port) = bind_listener().await.context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_once(key: DocumentKey) -> anyhow::Result<()> {
    config::init_config();
    logging::init_tracing_stderr();
    let pipeline = EnrichmentPipeline::from_config(config::get_config())?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted; cancelling batch");
                cancel.cancel();
            }
        }
    });

    let (tx, mut rx) = mpsc::channel::<PipelineResult>(16);
    let printer = tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            let mut line = serde_json::to_vec(&result)?;
            line.push(b'\n');
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&line)?;
            stdout.flush()?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let report = pipeline.process(key, tx, cancel).await?;
    printer.await??;
    tracing::info!(
        batch = %key,
        emitted = report.emitted,
        cache_hits = report.cache_hits,
        failed = report.failed,
        abandoned = report.abandoned,
        "Batch complete"
    );
    Ok(())
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}

use clap::Parser;
use log::{error, info};
use relay::network::ServerMessage;
use relay::{DocumentStore, RelayServer};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Relay for multi-participant platformer scenes", long_about = None)]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of concurrent participants
    #[arg(short, long, default_value = "16")]
    max_participants: usize,

    /// Level JSON used when no saved document exists
    #[arg(short, long)]
    level: Option<PathBuf>,

    /// Where the scene document is saved and resumed from
    #[arg(short, long)]
    document: Option<PathBuf>,

    /// Seconds between document saves
    #[arg(long, default_value = "10")]
    save_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Tip: Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let document = DocumentStore::open(args.level.as_deref(), args.document.clone())?;
    info!(
        "Serving scene '{}' with {} elements and {} actors",
        document.document().scene_id,
        document.document().elements.len(),
        document.document().actors.len()
    );

    let addr = format!("{}:{}", args.host, args.port);
    let mut server = RelayServer::new(
        &addr,
        args.max_participants,
        document,
        Duration::from_secs(args.save_interval.max(1)),
    )
    .await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            if let Err(e) = shutdown.send(ServerMessage::Shutdown) {
                error!("Failed to request shutdown: {}", e);
            }
        }
    });

    server.run().await?;

    Ok(())
}

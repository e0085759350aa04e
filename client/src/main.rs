use clap::Parser;
use client::game::{Session, SessionConfig};
use client::input::{IdleInput, InputSource, ScriptedInput, WanderInput};
use client::network::{self, EventOutput};
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address to connect to
    #[arg(short = 'r', long, default_value = "127.0.0.1:8080")]
    relay: String,

    /// Participant name, matched against actor owner lists
    #[arg(short = 'n', long)]
    name: String,

    /// Join as an elevated participant
    #[arg(short = 'e', long)]
    elevated: bool,

    /// Actor to drive; created at the start point if missing
    #[arg(short = 'a', long)]
    actor: Option<String>,

    /// Input script to replay for the actor
    #[arg(short = 's', long)]
    script: Option<PathBuf>,

    /// Restart the script when it runs out
    #[arg(long)]
    loop_script: bool,

    /// Wander randomly with this seed instead of following a script
    #[arg(long)]
    wander: Option<u64>,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,

    /// Frames per second
    #[arg(short = 'f', long, default_value = "60")]
    fps: u32,

    /// Print trigger events as JSON lines on stdout
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let input: Box<dyn InputSource> = match (&args.script, args.wander) {
        (Some(path), _) => {
            let script = ScriptedInput::load(path)?;
            info!("Replaying {} input steps from {}", script.steps().len(), path.display());
            if args.loop_script {
                Box::new(script.looped())
            } else {
                Box::new(script)
            }
        }
        (None, Some(seed)) => {
            info!("Wandering with seed {}", seed);
            Box::new(WanderInput::new(seed))
        }
        (None, None) => Box::new(IdleInput),
    };

    info!("Starting participant '{}'...", args.name);
    info!("Connecting to: {}", args.relay);
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let session = Session::new(
        SessionConfig {
            name: args.name,
            elevated: args.elevated,
            actor: args.actor,
        },
        input,
    );

    let events = if args.json_events {
        EventOutput::JsonLines
    } else {
        EventOutput::Log
    };

    let mut client = network::Client::new(&args.relay, session, args.fake_ping, args.fps, events).await?;

    client.run().await?;

    Ok(())
}

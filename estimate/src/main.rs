use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use estimate_core::{logging, Config, Error, HostSession, ParticipantSession};
use estimate_proto::{Estimate, RoomCode, CARD_DECK};

#[derive(Parser)]
#[command(name = "estimate", about = "Planning poker over the local network")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "estimate.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a new room
    Host,
    /// Join an existing room by its code
    Join {
        /// Room code shared by the host
        room_code: String,
        /// Display name shown to the rest of the room
        #[arg(long, default_value = "Guest")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load_from(&cli.config)?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    // 3. Run the selected role
    match cli.command {
        Command::Host => run_host(&config).await,
        Command::Join { room_code, name } => {
            let room_code: RoomCode = room_code.parse()?;
            run_participant(&config, room_code, &name).await
        }
    }
}

async fn run_host(config: &Config) -> Result<()> {
    let host = HostSession::start(config).await?;
    println!("Room code: {}", host.room_code());
    println!("Commands: start (next round), quit");

    let mut state_rx = host.subscribe();
    let printer = tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow().clone();
            println!(
                "-- round {} | ready: {} --",
                state.round, state.can_start_next_round
            );
            for participant in state.roster() {
                println!("  {:<20} {}", participant.name, render(participant.estimate));
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "start" => match host.start_next_round().await {
                        Ok(round) => println!("Round {round} started"),
                        Err(Error::RoundNotReady) => {
                            println!("Not everyone has submitted yet");
                        }
                        Err(e) => warn!(error = %e, "start-next-round failed"),
                    },
                    "quit" => break,
                    other => println!("Unknown command: {other}"),
                }
            }
        }
    }

    printer.abort();
    host.shutdown().await;
    Ok(())
}

async fn run_participant(config: &Config, room_code: RoomCode, name: &str) -> Result<()> {
    let session = ParticipantSession::start(config, room_code, name).await?;
    println!("Cards: {CARD_DECK:?}");
    println!("Commands: <points> (select), submit, quit");

    let mut view_rx = session.subscribe();
    let printer = tokio::spawn(async move {
        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow().clone();
            println!(
                "-- {} | round {} | selected: {} --",
                view.connection_status,
                view.round,
                view.selected_card
                    .map_or_else(|| "-".to_string(), |p| p.to_string()),
            );
            for participant in &view.roster {
                println!("  {:<20} {}", participant.name, render(participant.estimate));
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                match input {
                    "" => {}
                    "quit" => break,
                    "submit" => match session.submit_estimate().await {
                        Ok(()) => println!("Submitted"),
                        Err(e) => println!("Cannot submit: {e}"),
                    },
                    _ => match input.parse::<u32>() {
                        Ok(points) => match session.select_card(points).await {
                            Ok(()) => println!("Selected {points}"),
                            Err(e) => println!("Cannot select: {e}"),
                        },
                        Err(_) => println!("Unknown command: {input}"),
                    },
                }
            }
        }
    }

    printer.abort();
    session.shutdown().await;
    Ok(())
}

fn render(estimate: Estimate) -> String {
    match estimate {
        Estimate::Unsubmitted => "-".to_string(),
        Estimate::Submitted(points) => points.to_string(),
        Estimate::Disconnected => "offline".to_string(),
    }
}

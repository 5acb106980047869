//! playtime-ctl: talks to playtime-daemon over its Unix socket.
//!
//! Each subcommand sends one request and prints the response data as JSON.

use clap::{Parser, Subcommand};
use playtime_daemon_protocol::{GameIdParams, LaunchGameParams, Method, RegisterGameParams};
use serde::Serialize;
use serde_json::Value;

mod daemon_client;
mod logging;

use daemon_client::{ClientError, DaemonClient};

#[derive(Parser)]
#[command(name = "playtime-ctl")]
#[command(about = "Control playtime-daemon from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon and tracker status
    Health,

    /// Add a game to the library, or update it
    Register {
        title: String,

        #[arg(long)]
        platform: Option<String>,

        #[arg(long)]
        install_dir: Option<String>,

        #[arg(long)]
        launch_command: Option<String>,
    },

    /// Launch a game and start a session
    Launch {
        game_id: i64,

        /// Overrides the stored launch command
        #[arg(long)]
        command: Option<String>,
    },

    /// End the active session for a game
    End { game_id: i64 },

    /// List active sessions
    Active,

    /// Show play time statistics for a game
    Stats { game_id: i64 },

    /// Stop the daemon, closing all open sessions
    Shutdown,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                tracing::error!(error = %err, "Failed to format response");
                std::process::exit(1);
            }
        },
        Err(err) => {
            tracing::error!(error = %err, "Request failed");
            eprintln!("playtime-ctl: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(command: Commands) -> Result<Value, ClientError> {
    let client = DaemonClient::from_env()?;
    let (method, params) = request_for(command)?;
    client.call(method, params)
}

fn request_for(command: Commands) -> Result<(Method, Option<Value>), ClientError> {
    Ok(match command {
        Commands::Health => (Method::GetHealth, None),
        Commands::Register {
            title,
            platform,
            install_dir,
            launch_command,
        } => (
            Method::RegisterGame,
            Some(to_params(&RegisterGameParams {
                title,
                platform,
                install_directory: install_dir,
                launch_command,
            })?),
        ),
        Commands::Launch { game_id, command } => (
            Method::LaunchGame,
            Some(to_params(&LaunchGameParams {
                game_id,
                launch_command: command,
            })?),
        ),
        Commands::End { game_id } => (
            Method::EndGameSession,
            Some(to_params(&GameIdParams { game_id })?),
        ),
        Commands::Active => (Method::GetActiveSessions, None),
        Commands::Stats { game_id } => (
            Method::GetPlayTime,
            Some(to_params(&GameIdParams { game_id })?),
        ),
        Commands::Shutdown => (Method::Shutdown, None),
    })
}

fn to_params<T: Serialize>(params: &T) -> Result<Value, ClientError> {
    serde_json::to_value(params)
        .map_err(|err| ClientError::InvalidResponse(format!("Failed to encode params: {}", err)))
}

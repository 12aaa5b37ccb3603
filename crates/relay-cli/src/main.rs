mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relay", about = "Realtime collaboration sessions over a local relay server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the relay server daemon
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },

    /// Create a session
    Create {
        /// Session ID (server assigns one if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Participant capacity
        #[arg(long, default_value = "8")]
        max_participants: usize,
    },

    /// List sessions
    List,

    /// Get session details
    Info {
        /// Session ID
        session: String,
    },

    /// Send a lifecycle event to a session
    Send {
        /// Session ID
        session: String,

        /// Event: init, ready, heartbeat, pause, resume, timeout, close, error
        event: String,

        /// Error message (for the error event)
        #[arg(long)]
        message: Option<String>,
    },

    /// Join a session as a participant
    Join {
        /// Session ID
        session: String,

        /// Participant ID
        participant: String,
    },

    /// Leave a session
    Leave {
        /// Session ID
        session: String,

        /// Participant ID
        participant: String,
    },

    /// Publish an event to a session channel
    Publish {
        /// Session ID
        session: String,

        /// Channel: chunk, tool_call, agent_state, presence, terminal, workflow
        channel: String,

        /// JSON payload
        data: String,
    },

    /// Stream a session's log as JSON lines, reconnecting on failure
    Watch {
        /// Session ID
        session: String,

        /// Offset to replay from (live-only if omitted)
        #[arg(long)]
        from: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ServerAction {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop,
    /// Check daemon status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { action } => match action {
            ServerAction::Start { foreground } => commands::server_start(foreground).await,
            ServerAction::Stop => commands::server_stop().await,
            ServerAction::Status => commands::server_status().await,
        },
        Commands::Create {
            id,
            max_participants,
        } => commands::session_create(id, max_participants).await,
        Commands::List => commands::session_list().await,
        Commands::Info { session } => commands::session_info(session).await,
        Commands::Send {
            session,
            event,
            message,
        } => commands::session_send(session, &event, message).await,
        Commands::Join {
            session,
            participant,
        } => commands::session_join(session, participant).await,
        Commands::Leave {
            session,
            participant,
        } => commands::session_leave(session, participant).await,
        Commands::Publish {
            session,
            channel,
            data,
        } => commands::session_publish(session, &channel, &data).await,
        Commands::Watch { session, from } => commands::session_watch(session, from).await,
    }
}

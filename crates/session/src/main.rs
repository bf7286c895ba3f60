// tandem-session: join a live document from the terminal.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tandem_session::collab::HttpCollaborator;
use tandem_session::command::{EditorCommand, Selection};
use tandem_session::config::SessionConfig;
use tandem_session::controller::{ControllerConfig, LocalUser, SessionController};
use tandem_session::driver::{spawn_session, SessionHandle, UiCommand};
use tandem_session::engine::Field;
use tandem_session::transport::{
    replication_url, DetachedTransport, ReplicationTransport, TransportEvent, WsTransport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tandem-session", about = "Realtime collaborative document session")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a document and edit it line by line from stdin
    Join(JoinArgs),
}

#[derive(Debug, Args)]
struct JoinArgs {
    /// Document to open
    #[arg(long)]
    document: String,
    /// Config file (defaults to ~/.tandem/session.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Replication endpoint, e.g. wss://collab.example.com/collab
    #[arg(long)]
    endpoint: Option<String>,
    /// Access token presented to the gateway
    #[arg(long)]
    token: Option<String>,
    /// Display name shown to other participants
    #[arg(long)]
    name: Option<String>,
    /// Start without connecting
    #[arg(long)]
    local_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Join(args) => join(args).await,
    }
}

async fn join(args: JoinArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from(path)
            .with_context(|| format!("failed to load session config `{}`", path.display()))?,
        None => SessionConfig::load(),
    };
    if args.endpoint.is_some() {
        config.endpoint = args.endpoint.clone();
    }
    if args.token.is_some() {
        config.token = args.token.clone();
    }
    if args.local_only {
        config.endpoint = None;
    }
    let name = args.name.clone().or_else(|| config.display_name.clone()).unwrap_or_else(|| "anonymous".into());
    let user = LocalUser { id: name.to_lowercase(), name };

    let collaborator = config
        .persistence_base_url
        .as_deref()
        .map(|base| HttpCollaborator::new(base, config.token.clone(), config.collaborator_timeout()))
        .transpose()
        .context("invalid persistence collaborator URL")?;

    let controller_config = ControllerConfig::from_session_config(&config);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let session = match config.endpoint.as_deref() {
        Some(endpoint) => {
            let url = replication_url(endpoint, &args.document, config.token.as_deref())?;
            info!(document_id = %args.document, endpoint = %endpoint, "joining document");
            let transport = WsTransport::new(url, config.connect_timeout(), events_tx);
            start(&args.document, controller_config, user, transport, collaborator, events_rx)
        }
        None => {
            info!(document_id = %args.document, "no replication endpoint; editing locally");
            start(&args.document, controller_config, user, DetachedTransport, collaborator, events_rx)
        }
    };

    run_until_shutdown(session).await
}

fn start<T>(
    document_id: &str,
    config: ControllerConfig,
    user: LocalUser,
    transport: T,
    collaborator: Option<HttpCollaborator>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
) -> SessionHandle
where
    T: ReplicationTransport + Send + Sync + 'static,
{
    let controller = SessionController::new(document_id, config, user, transport);
    spawn_session(controller, collaborator, events)
}

async fn run_until_shutdown(session: SessionHandle) -> Result<()> {
    let mut status = session.status();
    let mut presence = session.presence();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                info!(status = status.borrow_and_update().label(), "session status");
            }
            changed = presence.changed() => {
                if changed.is_err() {
                    break;
                }
                let names: Vec<String> =
                    presence.borrow_and_update().iter().map(|entry| entry.display_name.clone()).collect();
                info!(participants = ?names, "presence");
            }
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => {
                        if let Err(error) = handle_line(&session, line.trim()).await {
                            warn!(?error, "command failed");
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(error) = session.save_snapshot().await {
        warn!(?error, "snapshot not saved");
    }
    let content = session.wait().await?;
    info!(title = %content.title, body_len = content.body.len(), "session closed");
    Ok(())
}

/// `/local`, `/retry`, `/save`, `/comment <start> <end> <text>`; anything
/// else is appended to the body as a new paragraph.
async fn handle_line(session: &SessionHandle, line: &str) -> Result<()> {
    let mut parts = line.splitn(4, ' ');
    match parts.next() {
        Some("/local") => session.send(UiCommand::GoLocalOnly),
        Some("/retry") => session.send(UiCommand::Retry),
        Some("/save") => session.save_snapshot().await,
        Some("/comment") => {
            let start: u32 = parts.next().context("missing start")?.parse().context("invalid start")?;
            let end: u32 = parts.next().context("missing end")?.parse().context("invalid end")?;
            let text = parts.next().unwrap_or_default();
            let id = session.create_comment(start, end, text).await?;
            info!(comment_id = %id, "comment created");
            Ok(())
        }
        _ if line.is_empty() => Ok(()),
        _ => {
            let body = session.content().await?.body;
            let end = body.encode_utf16().count() as u32;
            if end > 0 {
                session.apply(Selection::caret(Field::Body, end), EditorCommand::InsertParagraph)?;
            }
            session.apply(Selection::caret(Field::Body, end + u32::from(end > 0)), EditorCommand::InsertText {
                text: line.to_string(),
            })
        }
    }
}

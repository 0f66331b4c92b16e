use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use dm_client::{
    logging, ClientConfig, E2eeError, HttpKeyDirectory, ManagerConfig, SessionManager,
};
use dm_proto::StoredMessage;
use dm_store::{SqliteStore, Vault};

const ENV_PASSWORD: &str = "DM_E2EE_PASSWORD";

#[derive(Parser)]
#[command(name = "dm-e2ee")]
#[command(about = "End-to-end encrypted direct messages", long_about = None)]
struct Cli {
    /// Config file (default: config.json in the data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local store and device identity
    Init,

    /// Show this device's public key and fingerprint
    Identity,

    /// Rotate prekeys if due and upload keys to the directory
    Publish,

    /// Encrypt a message for a peer and print the envelope
    Encrypt {
        #[arg(long)]
        peer: String,
        /// Message text (read from stdin when omitted)
        #[arg(long)]
        message: Option<String>,
    },

    /// Decrypt an envelope received from a peer
    Decrypt {
        #[arg(long)]
        peer: String,
        /// Envelope string (read from stdin when omitted)
        #[arg(long)]
        envelope: Option<String>,
        /// Server message id; keeps the text so `history` can show it later
        #[arg(long)]
        id: Option<String>,
    },

    /// Start a session with a peer without sending anything
    Connect {
        #[arg(long)]
        peer: String,
    },

    /// Forget the session with a peer
    Reset {
        #[arg(long)]
        peer: String,
    },

    /// List peers with a stored session
    Sessions,

    /// Render a conversation exported as a JSON array of messages
    History {
        /// JSON file with the stored messages
        file: PathBuf,
        /// Our own user id on the platform
        #[arg(long)]
        me: String,
    },
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("reading stdin")?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

fn vault_password() -> Result<String> {
    if let Ok(pw) = std::env::var(ENV_PASSWORD) {
        return Ok(pw);
    }
    rpassword::prompt_password("Vault password: ").context("reading password")
}

async fn open_store(config: &ClientConfig) -> Result<SqliteStore> {
    let db_path = config.db_path()?;
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    let store = SqliteStore::open(&db_path, Vault::new())
        .await
        .map_err(E2eeError::from)?;
    let password = vault_password()?;
    store
        .unlock(password.as_bytes())
        .await
        .map_err(E2eeError::from)?;
    Ok(store)
}

async fn open_manager(config: &ClientConfig) -> Result<SessionManager> {
    let store = open_store(config).await?;
    let directory = HttpKeyDirectory::new(
        &config.api_base_url,
        config.api_token.clone(),
        config.fetch_timeout(),
    )?;
    let manager = SessionManager::open(
        Arc::new(store),
        Arc::new(directory),
        ManagerConfig::from(config),
    )
    .await?;
    Ok(manager)
}

/// Directory failures get the message the UI would show.
fn explain(e: E2eeError) -> anyhow::Error {
    if e.secure_chat_unavailable() {
        anyhow!("secure chat unavailable with this user: {e}")
    } else {
        e.into()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing(logging::DEFAULT_DIRECTIVES);
    let cli = Cli::parse();
    let config = ClientConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Init | Commands::Identity => {
            let manager = open_manager(&config).await?;
            let key = manager.identity_public();
            println!("public key:  {}", key.to_b64());
            println!("fingerprint: {}", key.fingerprint());
        }
        Commands::Publish => {
            let manager = open_manager(&config).await?;
            manager.publish_keys().await?;
            println!("keys published");
        }
        Commands::Encrypt { peer, message } => {
            let text = match message {
                Some(m) => m,
                None => read_stdin()?,
            };
            let manager = open_manager(&config).await?;
            let wire = manager.send(&peer, &text).await.map_err(explain)?;
            println!("{wire}");
        }
        Commands::Decrypt { peer, envelope, id } => {
            let wire = match envelope {
                Some(e) => e,
                None => read_stdin()?,
            };
            let manager = open_manager(&config).await?;
            let text = match id {
                Some(id) => manager.receive_message(&peer, &id, wire.trim()).await?,
                None => manager.receive_text(&peer, wire.trim()).await?,
            };
            println!("{text}");
        }
        Commands::Connect { peer } => {
            let manager = open_manager(&config).await?;
            manager.ensure_session(&peer).await.map_err(explain)?;
            println!("session ready with {peer}");
        }
        Commands::Reset { peer } => {
            let manager = open_manager(&config).await?;
            if manager.reset_session(&peer).await? {
                println!("session with {peer} removed");
            } else {
                println!("no session with {peer}");
            }
        }
        Commands::Sessions => {
            let manager = open_manager(&config).await?;
            for peer in manager.peers().await? {
                println!("{peer}");
            }
        }
        Commands::History { file, me } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let messages: Vec<StoredMessage> =
                serde_json::from_str(&raw).context("parsing message list")?;
            let manager = open_manager(&config).await?;
            let rendered = manager.render_history(&messages, &me).await;
            for (message, (_, body)) in messages.iter().zip(rendered) {
                println!(
                    "[{}] {}: {}",
                    message.sent_at.format("%Y-%m-%d %H:%M"),
                    message.sender_id,
                    body.text()
                );
            }
        }
    }
    Ok(())
}

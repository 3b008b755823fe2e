//! Command line host for the group engine: replays stored moderation
//! events into live groups and issues or checks NIP-42 challenges.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use stonr_groups::{
    auth,
    clock::SystemClock,
    config::Settings,
    event::{is_hex32, Event},
    groups::{CapabilityPolicy, GroupRegistry},
    store::MemoryStore,
};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "stonr-groups",
    author,
    version,
    about = "NIP-29 group state and NIP-42 authentication for Nostr relays"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` if missing and create `STORE_ROOT`.
    Init,
    /// Replay stored moderation events and print every live group.
    Groups,
    /// Print an unsigned authentication event with a fresh challenge.
    Challenge {
        /// Public key (hex) of the client being challenged.
        pubkey: String,
    },
    /// Authorize and apply one live moderation event, then store it.
    Apply {
        /// Path to the signed moderation event JSON.
        file: PathBuf,
    },
    /// Check a signed authentication event against a challenge.
    VerifyAuth {
        /// Path to the signed event JSON.
        file: PathBuf,
        /// Challenge the event must answer.
        #[arg(long)]
        challenge: String,
    },
}

/// Execute the selected CLI subcommand, writing results to `out`.
fn run(cli: Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    match cli.command {
        Commands::Init => {
            fs::create_dir_all(&cfg.store_root)
                .with_context(|| format!("creating {}", cfg.store_root.display()))?;
        }
        Commands::Groups => {
            let registry = load_registry(&cfg)?;
            for id in registry.ids() {
                if let Some(group) = registry.get(&id) {
                    writeln!(out, "{}", serde_json::to_string(&group.snapshot())?)?;
                }
            }
        }
        Commands::Apply { file } => {
            let ev = read_event(&file)?;
            if cfg.verify_sig {
                ev.verify().context("bad signature")?;
            }
            let registry = load_registry(&cfg)?;
            let policy = CapabilityPolicy::standard(cfg.relay_pubkey.clone());
            let transition = registry
                .handle(&ev, &policy)
                .with_context(|| format!("event {} refused", ev.id))?;
            tracing::info!(id = %ev.id, kind = ev.kind, ?transition, "moderation event applied");
            let path = cfg.store_root.join(format!("{}.json", ev.id));
            fs::write(&path, serde_json::to_string(&ev)?)
                .with_context(|| format!("writing {}", path.display()))?;
            match registry.resolve(&ev) {
                Some(group) => writeln!(out, "{}", serde_json::to_string(&group.snapshot())?)?,
                None => writeln!(out, "deleted")?,
            }
        }
        Commands::Challenge { pubkey } => {
            if !is_hex32(&pubkey) {
                bail!("pubkey must be 64 hex characters");
            }
            let challenge = auth::new_challenge();
            let ev = auth::create_challenge_event(&challenge, &pubkey, &cfg.relay_url());
            writeln!(out, "{}", serde_json::to_string(&ev)?)?;
        }
        Commands::VerifyAuth { file, challenge } => {
            let ev = read_event(&file)?;
            match auth::validate_auth_event(&ev, &challenge, &cfg.relay_url()) {
                Some(pubkey) => writeln!(out, "{pubkey}")?,
                None => bail!("authentication failed"),
            }
        }
    }
    Ok(())
}

/// Replay every stored event under `STORE_ROOT` into a fresh registry.
fn load_registry(cfg: &Settings) -> anyhow::Result<GroupRegistry> {
    let store = MemoryStore::new();
    let added = store.load_dir(&cfg.store_root, cfg.verify_sig)?;
    tracing::info!(events = added, root = %cfg.store_root.display(), "store loaded");
    let mut registry = GroupRegistry::new(cfg.registry_config(), Arc::new(SystemClock));
    registry.load(&store)?;
    Ok(registry)
}

fn read_event(file: &Path) -> anyhow::Result<Event> {
    let data =
        fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    serde_json::from_str(&data).context("parsing event")
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("stonr-groups-data");
    let mut content = String::new();
    content.push_str("DOMAIN=localhost\n");
    content.push_str(&format!("STORE_ROOT={}\n", store_root.to_string_lossy()));
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("RELAY_PUBKEY=\n");
    content.push_str("MAX_MODERATION_EVENTS=500\n");
    content.push_str("DELETED_GRACE_SECS=60\n");
    content.push_str("MAX_ACTION_AGE_SECS=60\n");
    content.push_str("GROUP_ROLES=admin,moderator,member\n");
    content.push_str("CREATOR_ROLE=admin\n");
    content.push_str("MEMBER_ROLE=member\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli, &mut io::stdout().lock())
}

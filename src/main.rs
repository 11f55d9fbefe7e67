use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use esimkit_core::{
    config::{EsimConfig, LogSink, LoggingConfig},
    inventory::{self, InventoryEntry, InventoryStore},
    lpa::{self, ActivationDescriptor},
    qr,
    session::{Credentials, SessionCache, SessionManager},
    transport::HttpTransport,
    util,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "esimkit",
    version = util::VERSION,
    about = "eSIM provisioning toolkit: activation codes, QR, inventory, status"
)]
struct Cli {
    /// Path to the inventory database (SQLite).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to the persisted API session.
    #[arg(long, global = true)]
    session_cache: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build an LPA activation string from its fields.
    Build {
        #[arg(long)]
        server: String,
        #[arg(long)]
        code: Option<String>,
    },

    /// Parse a strict LPA activation string.
    Parse { raw: String },

    /// Classify free-form text (LPA, install URL, bare address, base64).
    Extract { text: String },

    /// Print the iOS install link for scanned or pasted text.
    Link { text: String },

    /// Render an activation string as a PNG QR code.
    QrEncode {
        raw: String,
        #[arg(long)]
        out: PathBuf,
    },

    /// Read a QR code from an image and describe its content.
    QrDecode { image: PathBuf },

    /// Manage the single-use activation-code inventory.
    Inventory {
        #[command(subcommand)]
        cmd: InventoryCommands,
    },

    /// Log in to the fulfillment API and cache the session.
    Login,

    /// Query live status of a provisioned eSIM by ICCID.
    Status {
        iccid: String,
        /// Print the raw document as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
enum InventoryCommands {
    /// Add an entry from an LPA string.
    Add {
        lpa: String,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Add an entry from a server address and optional activation code.
    AddServer {
        #[arg(long)]
        server: String,
        #[arg(long)]
        code: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// List available entries (newest first), or used ones with `--used`.
    List {
        #[arg(long)]
        used: bool,
    },

    /// Show one entry.
    Show { id: String },

    /// Mark an entry used.  Exits non-zero if it was already taken.
    Claim {
        id: String,
        #[arg(long)]
        by: String,
    },

    /// Print entry counts.
    Stats,

    /// Export every entry to a JSON backup file.
    Export {
        #[arg(long)]
        out: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = EsimConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();
    cfg.validate().context("validate config")?;

    init_logging(&cfg.logging).context("init logging")?;

    let db_path = cli.db.unwrap_or(cfg.paths.inventory_db.clone());
    util::validate_path(&db_path, "db")?;
    let cache_path = cli
        .session_cache
        .unwrap_or(cfg.paths.session_cache.clone());
    util::validate_path(&cache_path, "session cache")?;

    match cli.cmd {
        Commands::Build { server, code } => {
            let descriptor = ActivationDescriptor::validated(&server, code.as_deref())
                .context("build activation code")?;
            println!("{descriptor}");
        }

        Commands::Parse { raw } => {
            let descriptor = lpa::parse(&raw).context("parse LPA string")?;
            if let Err(e) = lpa::validate_server_address(descriptor.server_address()) {
                warn!(reason = %e.reason(), "server address looks invalid");
            }
            print_json(&descriptor)?;
        }

        Commands::Extract { text } => {
            print_json(&lpa::inspect(&text))?;
        }

        Commands::Link { text } => {
            println!("{}", lpa::install_link_for(&text));
        }

        Commands::QrEncode { raw, out } => {
            util::validate_path(&out, "output")?;
            let png = qr::encode_with(&raw, &cfg.qr).context("encode QR")?;
            std::fs::write(&out, png).with_context(|| format!("write {}", out.display()))?;
            info!(out = %out.display(), "QR code written");
        }

        Commands::QrDecode { image } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("read {}", image.display()))?;
            let analysis = qr::analyze(&bytes);
            print_json(&analysis)?;
            if !analysis.qr_detected {
                std::process::exit(1);
            }
        }

        Commands::Inventory { cmd } => {
            let store = InventoryStore::open(&db_path).context("open inventory")?;
            run_inventory(&store, cmd)?;
        }

        Commands::Login => {
            let manager = session_manager(&cfg, cache_path)?;
            anyhow::ensure!(manager.login(), "login failed; see log for details");
            println!("Logged in; session cached.");
        }

        Commands::Status { iccid, json } => {
            let manager = session_manager(&cfg, cache_path)?;
            let status = manager.check_iccid(&iccid).map_err(|e| {
                anyhow::anyhow!("status query failed ({}): {}", e.kind(), e.reason())
            })?;
            if json {
                print_json(&status)?;
            } else {
                print!("{}", status.summary());
            }
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_inventory(store: &InventoryStore, cmd: InventoryCommands) -> Result<()> {
    match cmd {
        InventoryCommands::Add { lpa, description } => {
            let id = store
                .add_from_raw(&lpa, &description)
                .context("add inventory entry")?;
            println!("{id}");
        }

        InventoryCommands::AddServer {
            server,
            code,
            description,
        } => {
            let id = store
                .add_server(&server, code.as_deref(), &description)
                .context("add inventory entry")?;
            println!("{id}");
        }

        InventoryCommands::List { used } => {
            let entries = if used {
                store.list_used()
            } else {
                store.list_available()
            }
            .context("list inventory")?;
            for entry in &entries {
                println!("{}", entry_line(entry));
            }
            info!(count = entries.len(), used, "inventory listed");
        }

        InventoryCommands::Show { id } => {
            let entry = store
                .get_by_id(&id)
                .context("read inventory entry")?
                .with_context(|| format!("no inventory entry with id {id}"))?;
            print_json(&entry)?;
        }

        InventoryCommands::Claim { id, by } => {
            if store.claim(&id, &by).context("claim inventory entry")? {
                println!("claimed {id}");
            } else {
                eprintln!("entry {id} is missing or already used");
                std::process::exit(1);
            }
        }

        InventoryCommands::Stats => {
            let stats = store.stats().context("inventory stats")?;
            println!(
                "total: {}  available: {}  used: {}",
                stats.total, stats.available, stats.used
            );
        }

        InventoryCommands::Export { out } => {
            util::validate_path(&out, "output")?;
            let count =
                inventory::export_inventory_json(store, &out).context("export inventory")?;
            println!("exported {count} entries to {}", out.display());
        }
    }
    Ok(())
}

fn entry_line(entry: &InventoryEntry) -> String {
    let mut line = format!(
        "{}  {}  {}  {}",
        entry.id,
        entry.added_at_utc,
        entry.status().as_str(),
        entry.descriptor
    );
    if let (Some(at), Some(by)) = (entry.used_at_utc(), entry.used_by()) {
        line.push_str(&format!("  used {at} by {by}"));
    }
    if !entry.description.is_empty() {
        line.push_str(&format!("  # {}", entry.description));
    }
    line
}

fn session_manager(cfg: &EsimConfig, cache_path: PathBuf) -> Result<SessionManager<HttpTransport>> {
    let transport = HttpTransport::new(&cfg.api).context("build HTTP client")?;
    let manager =
        SessionManager::new(transport, &cfg.api).with_cache(SessionCache::new(cache_path));
    Ok(match Credentials::from_config(&cfg.api) {
        Some(credentials) => manager.with_credentials(credentials),
        None => {
            warn!("no API credentials configured; relying on the cached session");
            manager
        }
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    match cfg.sink() {
        LogSink::JsonStderr => {
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr);
            registry.with(json_layer).init();
        }
        LogSink::JsonFile(path) => {
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open json log file {}", path.display()))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::sync::Mutex::new(log_file));
            let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            registry.with(file_layer).with(console_layer).init();
        }
        LogSink::Stderr => {
            let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            registry.with(console_layer).init();
        }
    }
    Ok(())
}

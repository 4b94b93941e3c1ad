use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use structopt::StructOpt;
use uuid::Uuid;

use streamwarden::config::{Config, ServerKind};
use streamwarden::geolocation::open_resolver;
use streamwarden::normalizer::{split_response, Normalizer};
use streamwarden::persistence::{SessionStore, SqliteStore};

/// Streamwarden command line interface
#[derive(StructOpt, Debug)]
#[structopt(name = "warden", about = "Media server session tracking CLI")]
pub enum Cli {
    /// Generate a default configuration file
    Config {
        /// Output path for the configuration file
        #[structopt(short, long, default_value = "config.toml")]
        output: PathBuf,
    },
    /// Validate a configuration file
    Check {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Parse a saved sessions response and print the canonical sessions
    Normalize {
        /// plex, jellyfin or emby
        #[structopt(short, long)]
        vendor: Vendor,
        /// Path to the raw JSON body
        #[structopt(short, long)]
        file: PathBuf,
        /// Server id to stamp on the sessions
        #[structopt(short, long, default_value = "cli")]
        server: String,
        /// Optional GeoLite2-City database
        #[structopt(long)]
        geoip: Option<PathBuf>,
    },
    /// List recent violations
    Violations {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[structopt(short, long, default_value = "20")]
        limit: usize,
    },
    /// Acknowledge a violation
    Ack {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[structopt(long)]
        id: Uuid,
    },
    /// Show the trust score of an account and its identity
    Trust {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        /// Server-scoped account id, e.g. "plex-main:12"
        #[structopt(short, long)]
        account: String,
    },
    /// Link an account to a cross-server identity
    Link {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[structopt(short, long)]
        account: String,
        #[structopt(short, long)]
        identity: String,
    },
    /// List stored rules
    Rules {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List sessions that are still open
    Sessions {
        #[structopt(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Vendor(ServerKind);

impl FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plex" => Ok(Vendor(ServerKind::Plex)),
            "jellyfin" => Ok(Vendor(ServerKind::Jellyfin)),
            "emby" => Ok(Vendor(ServerKind::Emby)),
            other => Err(format!("unknown vendor '{}'", other)),
        }
    }
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        eprintln!("Configuration file not found: {:?}, using defaults", path);
        Ok(Config::default())
    }
}

fn open_store(path: &Path) -> Result<SqliteStore, Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    Ok(SqliteStore::new(&config.storage.database_path)?.with_initial_trust(config.trust.initial_score))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Warn)
        .init();

    let cli = Cli::from_args();

    match cli {
        Cli::Config { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Default configuration written to: {:?}", output);
        }
        Cli::Check { config } => match Config::from_file(&config) {
            Ok(parsed) => {
                println!(
                    "Configuration OK: {} server(s), {} seed rule(s)",
                    parsed.servers.len(),
                    parsed.rules.len()
                );
            }
            Err(e) => {
                eprintln!("Invalid configuration {:?}: {}", config, e);
                std::process::exit(1);
            }
        },
        Cli::Normalize {
            vendor,
            file,
            server,
            geoip,
        } => {
            if !file.exists() {
                eprintln!("File not found: {:?}", file);
                std::process::exit(1);
            }
            let body = std::fs::read_to_string(&file)?;
            let raws = split_response(vendor.0, &body)?;
            let normalizer = Normalizer::new(open_resolver(geoip.as_deref()));
            let sessions = normalizer.normalize_all(&server, &raws, Utc::now());

            println!("Parsed {} entr(ies), {} session(s):\n", raws.len(), sessions.len());
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Cli::Violations { config, limit } => {
            let store = open_store(&config)?;
            let violations = store.get_recent_violations(limit)?;
            println!("{} violation(s):\n", violations.len());
            for v in violations {
                println!(
                    "  {} [{}] {} - Account: {}, Session: {}, At: {}{}",
                    v.id,
                    v.severity,
                    v.rule_type,
                    v.server_user_id,
                    v.session_id,
                    v.created_at,
                    if v.is_acknowledged() { " (acknowledged)" } else { "" }
                );
            }
        }
        Cli::Ack { config, id } => {
            let store = open_store(&config)?;
            if store.acknowledge_violation(id, Utc::now())? {
                println!("Acknowledged {}", id);
            } else {
                eprintln!("No open violation with id {}", id);
                std::process::exit(1);
            }
        }
        Cli::Trust { config, account } => {
            let store = open_store(&config)?;
            println!("{}: {}", account, store.get_trust_score(&account)?);
            if let Some((identity, linked)) = store.identity_for_account(&account)? {
                println!(
                    "Identity {} ({} linked account(s)): {}",
                    identity,
                    linked,
                    store.get_identity_score(&identity)?
                );
            }
        }
        Cli::Link {
            config,
            account,
            identity,
        } => {
            let store = open_store(&config)?;
            store.link_account_identity(&account, &identity)?;
            println!("Linked {} to identity {}", account, identity);
        }
        Cli::Rules { config } => {
            let store = open_store(&config)?;
            for rule in store.list_rules()? {
                println!(
                    "  {} [{}] {}{}{} params={}",
                    rule.id,
                    rule.rule_type,
                    rule.name,
                    rule.server_user_id
                        .as_deref()
                        .map(|u| format!(" (only {})", u))
                        .unwrap_or_default(),
                    if rule.is_active { "" } else { " (inactive)" },
                    rule.params
                );
            }
        }
        Cli::Sessions { config } => {
            let store = open_store(&config)?;
            let sessions = store.get_active_sessions()?;
            println!("{} open session(s):\n", sessions.len());
            for s in sessions {
                println!(
                    "  {} {} - {} on {} ({}) from {} [{}], since {}",
                    s.id,
                    s.username.as_deref().unwrap_or(&s.server_user_id),
                    s.media.title,
                    s.server_id,
                    s.state,
                    s.ip_address,
                    s.geo.display_location(),
                    s.started_at
                );
            }
        }
    }

    Ok(())
}

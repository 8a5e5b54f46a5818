//! `fieldseal` CLI tool for keys, payloads and search terms.

#![warn(clippy::pedantic, clippy::nursery)]

mod demo;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fieldseal::prelude::*;
use fieldseal::storage::EncryptedComposite;
use fieldseal_local::LocalProvider;
use std::path::{Path, PathBuf};

/// Schema used when no config file is given.
pub(crate) const DEFAULT_CONFIG: &str = r#"
[[tables]]
name = "users"

[[tables.columns]]
name = "email"
capabilities = ["equality", "free_text_search", "order_and_range"]

[[tables.columns]]
name = "name"
capabilities = ["equality", "free_text_search", "order_and_range"]
"#;

#[derive(Parser)]
#[command(name = "fieldseal")]
#[command(about = "Searchable field-level encryption CLI", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file declaring limits and encrypted columns
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Column selection shared by the field commands.
#[derive(clap::Args)]
struct Target {
    /// Key directory created by `keygen`
    #[arg(short, long, default_value = "./keys")]
    keys: PathBuf,
    /// Table name
    #[arg(short, long)]
    table: String,
    /// Column name
    #[arg(long)]
    column: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Form {
    /// Equality term
    Exact,
    /// `ilike` pattern term
    Pattern,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate new root keys
    Keygen {
        /// Output directory for keys
        #[arg(short, long, default_value = "./keys")]
        output: PathBuf,
    },
    /// Encrypt a value and print its storage composite
    Encrypt {
        #[command(flatten)]
        target: Target,
        /// Value: JSON scalar (`42`, `true`) or plain text
        value: String,
    },
    /// Decrypt a storage composite
    Decrypt {
        #[command(flatten)]
        target: Target,
        /// Composite JSON document
        composite: String,
    },
    /// Derive a search term
    Term {
        #[command(flatten)]
        target: Target,
        /// Term form
        #[arg(long, value_enum, default_value = "exact")]
        form: Form,
        /// Value or pattern
        value: String,
    },
    /// Run insert, list and search against an in-memory store
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Keygen { output } => {
            let provider = LocalProvider::init(&output)
                .with_context(|| format!("failed to initialize {}", output.display()))?;
            println!("Generated keys in {} (key id {})", output.display(), provider.key_id());
        }
        Commands::Encrypt { target, value } => {
            let (codec, policy) = open(&config, &target)?;
            let payload = codec.encrypt(&parse_value(&value), &policy).await?;
            println!("{}", EncryptedComposite::from_payload(&payload)?.to_json()?);
        }
        Commands::Decrypt { target, composite } => {
            let (codec, policy) = open(&config, &target)?;
            let payload = EncryptedComposite::from_json(&composite)?.to_payload()?;
            let value = codec.decrypt(&payload, &policy).await?;
            println!("{}", serde_json::to_string(&value)?);
        }
        Commands::Term { target, form, value } => {
            let (codec, policy) = open(&config, &target)?;
            let form = match form {
                Form::Exact => ReturnForm::Exact,
                Form::Pattern => ReturnForm::Pattern,
            };
            let term = codec.terms().derive_term(&parse_value(&value), &policy, form).await?;
            println!("{}", serde_json::to_string(&term)?);
        }
        Commands::Demo => demo::run(&config).await?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::from_toml_str(DEFAULT_CONFIG)?);
    };
    tracing::info!("Using config: {}", path.display());
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Config::from_toml_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn open(config: &Config, target: &Target) -> Result<(Codec<LocalProvider>, ColumnPolicy)> {
    if !target.keys.exists() {
        bail!("key directory {} not found, run `fieldseal keygen` first", target.keys.display());
    }
    let provider = LocalProvider::open(&target.keys)
        .with_context(|| format!("failed to load keys from {}", target.keys.display()))?;
    let policy = config.schema().column(&target.table, &target.column)?.clone();
    Ok((Codec::new(provider, config.limits.clone()), policy))
}

fn parse_value(raw: &str) -> PlaintextValue {
    serde_json::from_str(raw).unwrap_or_else(|_| PlaintextValue::Text(raw.to_string()))
}

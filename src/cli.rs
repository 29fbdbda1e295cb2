use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use keygate::config::Config;
use keygate::credentials::{CredentialBackend, KeyRegistry};
use keygate::key_generator::issue_key;
use keygate::server::Server;

#[derive(Parser)]
#[command(name = "keygate")]
#[command(author, version, about = "Authenticating reverse proxy for node backends")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway
    Start,

    /// Manage API keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Generate a new API key
    Generate {
        /// Who the key is issued to
        #[arg(long, default_value = "default")]
        owner: String,

        /// Protocol the key is meant for
        #[arg(long, default_value = "ethereum")]
        protocol: String,
    },

    /// List all API keys
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete an API key
    Delete {
        /// Key to delete
        key: String,
    },
}

impl Cli {
    pub async fn run(self, config: Config) -> Result<()> {
        match self.command {
            Commands::Start => start(config).await,
            Commands::Key { command } => {
                let registry = CredentialBackend::from_config(&config).await?.registry();
                command.run(registry.as_ref()).await
            }
        }
    }
}

async fn start(config: Config) -> Result<()> {
    let credential_store = if config.redis_url.is_some() { "redis" } else { "file" };

    tracing::info!("Starting keygate");
    tracing::info!(
        bind_addr = %config.bind_addr,
        credential_store,
        "Configuration loaded"
    );

    let server = Server::new(config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

impl KeyCommands {
    async fn run(self, registry: &dyn KeyRegistry) -> Result<()> {
        match self {
            KeyCommands::Generate { owner, protocol } => {
                let record = issue_key(registry, &owner, &protocol).await?;
                println!("Generated API key: {}", record.key);
            }
            KeyCommands::List { json } => {
                let records = registry.list().await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else {
                    for record in records {
                        println!("{}\t{}\t{}", record.key, record.owner, record.protocol);
                    }
                }
            }
            KeyCommands::Delete { key } => {
                if !registry.revoke(&key).await? {
                    bail!("API key not found: {}", key);
                }
                println!("Deleted API key: {}", key);
            }
        }
        Ok(())
    }
}

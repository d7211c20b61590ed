//! juju-env CLI - command-line client for a backend environment
//!
//! Connects, logs in when credentials are configured, runs one operation,
//! and prints the result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use juju_env::env::{
    DELTA_KIND, Dialect, Endpoint, Environment, EnvironmentConfig, WebSocketConnector,
    load_config, write_config,
};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "juju-env")]
#[command(about = "WebSocket client for a backend environment", long_about = None)]
struct Cli {
    /// Config file (JSON)
    #[arg(short, long, default_value = "juju-env.json")]
    config: PathBuf,

    /// Socket URL, overriding the config file
    #[arg(long)]
    url: Option<String>,

    /// Backend dialect (go or python), overriding the config file
    #[arg(long)]
    dialect: Option<Dialect>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file
    InitConfig {
        /// User name for login
        #[arg(long)]
        user: Option<String>,

        /// Password for login
        #[arg(long)]
        password: Option<String>,

        /// Refuse write operations
        #[arg(long)]
        read_only: bool,
    },

    /// Show environment status
    Status,

    /// Deploy a charm
    Deploy {
        /// Charm URL
        charm_url: String,

        /// Service name
        service_name: String,

        /// Number of units
        #[arg(short, long, default_value = "1")]
        num_units: u32,

        /// Charm option as key=value (repeatable)
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
    },

    /// Relate two endpoints (service or service:relation)
    AddRelation {
        /// First endpoint
        endpoint_a: String,

        /// Second endpoint
        endpoint_b: String,
    },

    /// Change service options
    SetConfig {
        /// Service name
        service_name: String,

        /// Option as key=value (repeatable)
        #[arg(required = true)]
        options: Vec<String>,
    },

    /// Print environment deltas as they arrive
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::InitConfig {
        user,
        password,
        read_only,
    } = &cli.command
    {
        let mut config = EnvironmentConfig::default();
        apply_overrides(&mut config, &cli);
        if let (Some(user), Some(password)) = (user, password) {
            config = config.with_credentials(user.clone(), password.clone());
        }
        config.read_only = *read_only;
        config.validate()?;
        write_config(&cli.config, &config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        EnvironmentConfig::default()
    };
    apply_overrides(&mut config, &cli);

    let env = Environment::new(config, Arc::new(WebSocketConnector::new()))?;
    env.connect()
        .await
        .with_context(|| format!("failed to connect to {}", env.config().socket_url))?;
    if env.credentials().is_some() {
        env.login().await.context("login failed")?;
    }

    let result = match cli.command {
        Commands::InitConfig { .. } => unreachable!("handled above"),
        Commands::Status => env.status().await?,
        Commands::Deploy {
            charm_url,
            service_name,
            num_units,
            options,
        } => {
            env.deploy(charm_url, service_name, parse_options(&options)?, None, num_units)
                .await?
        }
        Commands::AddRelation {
            endpoint_a,
            endpoint_b,
        } => {
            let endpoint_a: Endpoint = endpoint_a.parse()?;
            let endpoint_b: Endpoint = endpoint_b.parse()?;
            serde_json::to_value(env.add_relation(endpoint_a, endpoint_b).await?)?
        }
        Commands::SetConfig {
            service_name,
            options,
        } => {
            env.set_config(service_name, parse_options(&options)?, None)
                .await?
        }
        Commands::Watch => {
            env.on(DELTA_KIND, |notification| {
                println!("{}", notification.payload["result"]);
            });
            env.watch_all().await?;
            tokio::signal::ctrl_c().await?;
            env.close();
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    env.close();
    Ok(())
}

fn apply_overrides(config: &mut EnvironmentConfig, cli: &Cli) {
    if let Some(url) = &cli.url {
        config.socket_url = url.clone();
    }
    if let Some(dialect) = cli.dialect {
        config.dialect = dialect;
    }
}

/// Parse `key=value` pairs; values that parse as JSON keep their type.
fn parse_options(options: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for option in options {
        let Some((key, value)) = option.split_once('=') else {
            bail!("option '{}' is not key=value", option);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

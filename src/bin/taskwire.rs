use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use anyhow::{Context as AnyhowContext, Result, bail};
use clap::{Parser, Subcommand};
use taskwire::config::Config;
use taskwire::definition::{extract, loader};
use taskwire::discovery::{ConsulDiscovery, DiscoveryBackend, ServiceRegistration};
use taskwire::runtime::Orchestrator;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the workflow engine and dispatch external tasks to services
    Run {
        /// Path to the YAML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Workflow engine REST base URL
        #[arg(long, env = "TASKWIRE_ENGINE_URL")]
        engine_url: Option<String>,

        /// Consul base URL; without it only the static service table is used
        #[arg(long, env = "TASKWIRE_DISCOVERY_URL")]
        discovery_url: Option<String>,

        /// Worker id used for task locks
        #[arg(long, env = "TASKWIRE_WORKER_ID")]
        worker_id: Option<String>,

        /// Directory of .bpmn/.xml process definitions
        #[arg(long)]
        definitions: Option<PathBuf>,
    },

    /// Print the topics and routing hints of a process definition
    Topics {
        file: PathBuf,
    },

    /// Register (or deregister) a service instance with Consul
    Register {
        #[arg(long, env = "TASKWIRE_DISCOVERY_URL", default_value = "http://localhost:8500")]
        discovery_url: String,

        #[arg(long)]
        name: String,

        #[arg(long = "type")]
        service_type: String,

        #[arg(long)]
        version: Option<String>,

        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long)]
        port: u16,

        /// Instance id; defaults to name-address-port
        #[arg(long)]
        id: Option<String>,

        /// Health check interval in seconds
        #[arg(long, default_value_t = 10)]
        check_interval: u64,

        /// Remove the instance instead of registering it
        #[arg(long)]
        deregister: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, engine_url, discovery_url, worker_id, definitions } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            if let Some(url) = engine_url {
                config.engine.base_url = url;
            }
            if discovery_url.is_some() {
                config.discovery.base_url = discovery_url;
            }
            if worker_id.is_some() {
                config.engine.worker_id = worker_id;
            }
            if definitions.is_some() {
                config.definitions_dir = definitions;
            }
            config.validate()?;
            if config.engine.worker_id.is_none() {
                config.engine.worker_id = Some(config.engine.worker_id());
            }

            info!(engine = %config.engine.base_url, discovery = ?config.discovery.base_url, "Starting taskwire");
            let orchestrator = Orchestrator::from_config(&config)?;

            let shutdown = orchestrator.shutdown_token();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("Shutdown requested, draining in-flight tasks");
                        shutdown.cancel();
                    }
                    Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
                }
            });

            let report = orchestrator.run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Topics { file } => {
            let xml = loader::load_definition(&file)?;
            let process = extract(&xml);
            if process.topics.is_empty() {
                warn!(file = %file.display(), "No topics found");
            }
            for topic in &process.topics {
                match process.hints.get(topic) {
                    Some(hint) => println!(
                        "{}\t{}/{}{}",
                        topic,
                        hint.service_type.as_deref().unwrap_or("-"),
                        hint.service_name.as_deref().unwrap_or("-"),
                        hint.service_version.as_deref().map(|v| format!("@{}", v)).unwrap_or_default(),
                    ),
                    None => println!("{}", topic),
                }
            }
        }

        Commands::Register { discovery_url, name, service_type, version, address, port, id, check_interval, deregister } => {
            let consul = ConsulDiscovery::new(discovery_url, Duration::from_secs(5))
                .context("Failed to build discovery client")?;
            let id = id.unwrap_or_else(|| format!("{}-{}-{}", name, address, port));

            if deregister {
                consul.deregister(&id).await?;
                info!(id = %id, "Service deregistered");
                return Ok(());
            }

            if name.trim().is_empty() || service_type.trim().is_empty() {
                bail!("--name and --type must not be empty");
            }
            let mut tags = vec![format!("type:{}", service_type)];
            if let Some(version) = &version {
                tags.push(format!("version:{}", version));
            }
            let registration = ServiceRegistration {
                health_check_url: Some(format!("http://{}:{}/health", address, port)),
                id: id.clone(),
                name,
                service_type,
                version,
                address,
                port,
                tags,
                meta: BTreeMap::new(),
                check_interval: Duration::from_secs(check_interval),
            };
            consul.register(&registration).await?;
            info!(id = %id, "Service registered");
        }
    }

    Ok(())
}

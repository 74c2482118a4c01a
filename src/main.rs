use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flotilla::config::Config;

mod commands;

#[derive(Parser)]
#[command(
    name = "flotilla",
    version,
    about = "Multi-region fleet orchestrator for weighted service revisions",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Config file path
    #[arg(short, long, global = true, default_value = "flotilla.toml")]
    config: PathBuf,

    /// Environment name
    #[arg(short, long, global = true, env = "FLOTILLA_ENV")]
    environment: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start as agent
    Agent {
        /// Service name
        #[arg(long, env = "FLOTILLA_SERVICE")]
        service: Option<String>,

        /// Load balancer name (optional)
        #[arg(long, env = "FLOTILLA_LB")]
        elb: Option<String>,

        /// Frequency of health writes (seconds)
        #[arg(long, env = "FLOTILLA_HEALTH_INTERVAL")]
        health_interval: Option<u64>,

        /// Frequency of assignment reads (seconds)
        #[arg(long, env = "FLOTILLA_ASSIGNMENT_INTERVAL")]
        assignment_interval: Option<u64>,
    },

    /// Start as scheduler
    Scheduler {
        /// Regions (multiple allowed)
        #[arg(short, long, env = "FLOTILLA_REGION", value_delimiter = ',')]
        region: Vec<String>,

        /// Frequency of lock checks (seconds)
        #[arg(long, env = "FLOTILLA_LOCK_INTERVAL")]
        lock_interval: Option<u64>,

        /// Frequency of the balance loop (seconds)
        #[arg(long, env = "FLOTILLA_LOOP_INTERVAL")]
        loop_interval: Option<u64>,

        /// Frequency of the provision loop (seconds)
        #[arg(long, env = "FLOTILLA_PROVISION_INTERVAL")]
        provision_interval: Option<u64>,
    },

    /// Bootstrap an environment: create tables and region records
    Init {
        /// Regions (multiple allowed)
        #[arg(short, long, env = "FLOTILLA_REGION", value_delimiter = ',')]
        region: Vec<String>,
    },

    /// Configure a region
    Region {
        /// Regions (multiple allowed)
        #[arg(short, long, env = "FLOTILLA_REGION", value_delimiter = ',')]
        region: Vec<String>,

        /// Admin users (multiple allowed)
        #[arg(long)]
        admin: Vec<String>,

        /// Worker instance type
        #[arg(long)]
        instance_type: Option<String>,

        /// Arbitrary KEY=value settings (multiple allowed)
        #[arg(long)]
        set: Vec<String>,
    },

    /// Configure a service
    Service {
        /// Service name
        #[arg(long)]
        name: String,

        /// Load balancer scheme (internal, internet-facing)
        #[arg(long)]
        elb_scheme: Option<String>,

        /// Custom DNS entry for the service
        #[arg(long)]
        dns_name: Option<String>,

        /// Load balancer health check target
        #[arg(long)]
        health_check: Option<String>,

        /// Worker instance type
        #[arg(long)]
        instance_type: Option<String>,

        /// Minimum worker count
        #[arg(long)]
        instance_min: Option<i64>,

        /// Maximum worker count
        #[arg(long)]
        instance_max: Option<i64>,

        /// KMS key id for environment encryption
        #[arg(long)]
        kms_key: Option<String>,

        /// Enable or disable automatic provisioning
        #[arg(long)]
        provision: Option<bool>,

        /// Admin users (multiple allowed)
        #[arg(long)]
        admin: Vec<String>,

        /// Public ports exposed by the balancer, e.g. 80-http (multiple allowed)
        #[arg(long)]
        public_port: Vec<String>,

        /// Private ports exposed to peers, e.g. 9300-tcp (multiple allowed)
        #[arg(long)]
        private_port: Vec<String>,
    },

    /// Publish and manage revisions
    Revision {
        #[command(subcommand)]
        command: RevisionCommands,
    },

    /// Configure a user
    User {
        /// User name
        #[arg(long)]
        name: String,

        /// SSH public keys (multiple allowed)
        #[arg(long)]
        ssh_key: Vec<String>,

        /// Mark the user active or inactive
        #[arg(long)]
        active: Option<bool>,
    },

    /// Print authorized SSH keys, intended as AuthorizedKeysCommand
    Keys {
        /// Resolve admins of this service
        #[arg(long)]
        service: Option<String>,

        /// Resolve bastion users instead
        #[arg(long, default_value = "false")]
        bastion: bool,
    },
}

#[derive(Subcommand)]
enum RevisionCommands {
    /// Publish a revision from a directory of unit definitions
    Add {
        /// Service name
        #[arg(long)]
        name: String,

        /// Revision label
        #[arg(long)]
        label: Option<String>,

        /// Revision weight
        #[arg(long, default_value = "1")]
        weight: i64,

        /// Directory containing *.service, *.env and *.json definitions
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Environment variable overrides, KEY=value (multiple allowed)
        #[arg(long)]
        env_var: Vec<String>,

        /// Wait this long for a healthy deployment, then retire other
        /// revisions; 0 disables the wait
        #[arg(long, default_value = "0")]
        timeout: u64,
    },

    /// Set a revision's weight
    Weight {
        /// Service name
        #[arg(long)]
        name: String,

        /// Revision hash
        #[arg(long)]
        revision: String,

        /// New weight
        #[arg(long)]
        weight: i64,
    },

    /// Delete a revision
    Del {
        /// Service name
        #[arg(long)]
        name: String,

        /// Revision hash
        #[arg(long)]
        revision: String,
    },

    /// List a service's revisions
    List {
        /// Service name
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    // Environment variables form the base; the file and flags override.
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::from_env()?
    };
    if cli.environment.is_some() {
        config.environment = cli.environment.clone();
    }

    match cli.command {
        Commands::Agent {
            service,
            elb,
            health_interval,
            assignment_interval,
        } => {
            if service.is_some() {
                config.service = service;
            }
            if elb.is_some() {
                config.balancer = elb;
            }
            if let Some(interval) = health_interval {
                config.agent.health_interval_secs = interval;
            }
            if let Some(interval) = assignment_interval {
                config.agent.assignment_interval_secs = interval;
            }
            commands::agent::run(config).await?;
        }

        Commands::Scheduler {
            region,
            lock_interval,
            loop_interval,
            provision_interval,
        } => {
            if !region.is_empty() {
                config.regions = region;
            }
            if let Some(interval) = lock_interval {
                config.scheduler.lock_interval_secs = interval;
            }
            if let Some(interval) = loop_interval {
                config.scheduler.loop_interval_secs = interval;
            }
            if let Some(interval) = provision_interval {
                config.scheduler.provision_interval_secs = interval;
            }
            commands::scheduler::run(config).await?;
        }

        Commands::Init { region } => {
            commands::init::bootstrap(config, region).await?;
        }

        Commands::Region {
            region,
            admin,
            instance_type,
            set,
        } => {
            let regions = if region.is_empty() {
                config.regions.clone()
            } else {
                region
            };
            commands::region::configure(config, regions, admin, instance_type, set).await?;
        }

        Commands::Service {
            name,
            elb_scheme,
            dns_name,
            health_check,
            instance_type,
            instance_min,
            instance_max,
            kms_key,
            provision,
            admin,
            public_port,
            private_port,
        } => {
            let updates = commands::service::ServiceUpdates {
                elb_scheme,
                dns_name,
                health_check,
                instance_type,
                instance_min,
                instance_max,
                kms_key,
                provision,
                admins: admin,
                public_ports: public_port,
                private_ports: private_port,
            };
            commands::service::configure(config, name, updates).await?;
        }

        Commands::Revision { command } => match command {
            RevisionCommands::Add {
                name,
                label,
                weight,
                dir,
                env_var,
                timeout,
            } => {
                commands::revision::add(config, name, label, weight, &dir, env_var, timeout)
                    .await?;
            }
            RevisionCommands::Weight {
                name,
                revision,
                weight,
            } => {
                commands::revision::set_weight(config, name, revision, weight).await?;
            }
            RevisionCommands::Del { name, revision } => {
                commands::revision::del(config, name, revision).await?;
            }
            RevisionCommands::List { name } => {
                commands::revision::list(config, name).await?;
            }
        },

        Commands::User {
            name,
            ssh_key,
            active,
        } => {
            commands::user::configure(config, name, ssh_key, active).await?;
        }

        Commands::Keys { service, bastion } => {
            commands::keys::print(config, service, bastion).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("flotilla=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("flotilla=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

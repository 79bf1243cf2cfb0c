mod sync;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lxm_core::{
    BindInterface, JsonStore, NewLease, NewRule, Protocol, ResourceClass, RuleStore, Settings,
    Snapshotter, SubnetRegistry, SystemRunner, validate_pool_membership, validate_target,
};
use lxm_dhcp::{DhcpService, LeaseReconciler};
use lxm_fw::{ChainManager, DnatReconciler};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use sync::Synchronizer;

#[derive(Parser)]
#[command(name = "lxm")]
#[command(version, about = "Declarative port forwards and static leases for LXC hosts", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = "/etc/lxm/lxm.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full resync of firewall and DHCP state from the rule store
    Sync,
    /// Reconcile one resource class now
    Reconcile {
        #[arg(value_enum)]
        class: ClassArg,
    },
    /// Show the live contents of the managed chain
    Status,
    /// Port forwarding rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Static DHCP leases
    Lease {
        #[command(subcommand)]
        action: LeaseAction,
    },
    /// Show effective settings
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ClassArg {
    Firewall,
    Dhcp,
}

impl From<ClassArg> for ResourceClass {
    fn from(value: ClassArg) -> Self {
        match value {
            ClassArg::Firewall => ResourceClass::Firewall,
            ClassArg::Dhcp => ResourceClass::Dhcp,
        }
    }
}

#[derive(Subcommand)]
enum RuleAction {
    /// Add a port forward and reconcile
    Add {
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: String,
        /// Destination as IP:PORT, e.g. 10.0.3.5:80
        #[arg(long)]
        target: String,
        /// Host interface to bind, or "all"
        #[arg(long, default_value = "all")]
        interface: String,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Delete a rule by id and reconcile
    Remove {
        #[arg(long)]
        id: u64,
    },
    /// List rules with their reconciliation state
    List,
}

#[derive(Subcommand)]
enum LeaseAction {
    /// Create or update a container's static lease and reconcile
    Set {
        #[arg(long)]
        name: String,
        #[arg(long)]
        mac: String,
        #[arg(long)]
        ip: Ipv4Addr,
    },
    /// Delete a lease and reconcile
    Remove {
        #[arg(long)]
        name: String,
    },
    /// List leases with their reconciliation state
    List,
}

/// Everything wired together for one invocation.
struct Engine {
    settings: Settings,
    store: Arc<JsonStore>,
    registry: SubnetRegistry,
    synchronizer: Synchronizer,
    fw: Arc<DnatReconciler>,
    dhcp: Arc<LeaseReconciler>,
}

fn build_engine(settings: Settings) -> Result<Engine> {
    let store = Arc::new(
        JsonStore::open(&settings.store_path)
            .with_context(|| format!("failed to open rule store {:?}", settings.store_path))?,
    );
    let runner = Arc::new(SystemRunner::new(settings.command_timeout()));
    let registry = SubnetRegistry::from_cidr(&settings.bridge_cidr)?;

    let chain = ChainManager::new(&settings.chain_name, runner.clone())
        .map_err(anyhow::Error::from)?;
    let fw = Arc::new(DnatReconciler::new(
        store.clone() as Arc<dyn RuleStore>,
        chain,
    ));

    let dhcp = Arc::new(LeaseReconciler::new(
        store.clone() as Arc<dyn RuleStore>,
        DhcpService::new(runner, settings.dhcp_service.clone()),
        &settings.dnsmasq_conf,
        Snapshotter::new(&settings.snapshot_dir),
    ));

    let synchronizer = Synchronizer::new(fw.clone(), dhcp.clone());

    Ok(Engine {
        settings,
        store,
        registry,
        synchronizer,
        fw,
        dhcp,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load_or_default(&cli.config)?;
    let engine = build_engine(settings)?;

    match cli.command {
        Commands::Sync => {
            let (fw, dhcp) = engine.synchronizer.startup_resync().await?;
            println!("{}", fw);
            println!("{}", dhcp);
        }
        Commands::Reconcile { class } => {
            let report = engine.synchronizer.reconcile_now(class.into()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let rules = engine.fw.managed_chain_state().await?;
            if rules.is_empty() {
                println!("managed chain {} is empty", engine.settings.chain_name);
            }
            for spec in rules {
                println!("{}", spec);
            }
            for (mac, name, ip) in engine.dhcp.current_leases().await? {
                println!("lease {} {} -> {}", name, mac, ip);
            }
        }
        Commands::Rule { action } => run_rule_action(&engine, action).await?,
        Commands::Lease { action } => run_lease_action(&engine, action).await?,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&engine.settings)?);
        }
    }

    Ok(())
}

async fn run_rule_action(engine: &Engine, action: RuleAction) -> Result<()> {
    match action {
        RuleAction::Add {
            port,
            protocol,
            target,
            interface,
            comment,
        } => {
            let (addr, target_port) = split_destination(&target)?;
            validate_target(&engine.registry, addr).map_err(anyhow::Error::from)?;

            let rule = engine
                .store
                .add_rule(NewRule {
                    external_port: port,
                    protocol: protocol.parse::<Protocol>()?,
                    target_address: addr,
                    target_port,
                    bind_interface: BindInterface::parse(&interface),
                    comment,
                })
                .await
                .map_err(anyhow::Error::from)?;
            println!("added rule {} ({})", rule.id, rule.spec());

            let report = engine.fw.reconcile().await?;
            println!("{}", report);
        }
        RuleAction::Remove { id } => {
            engine.store.remove_rule(id).await.map_err(anyhow::Error::from)?;
            let report = engine.fw.reconcile().await?;
            println!("{}", report);
        }
        RuleAction::List => {
            for rule in engine.store.list_all_rules().await {
                let flag = if rule.deleted { " (deleting)" } else { "" };
                let error = rule
                    .last_error
                    .as_deref()
                    .map(|e| format!(" [{}]", e))
                    .unwrap_or_default();
                println!(
                    "{:>4}  {:<9}{}  {}{}",
                    rule.id,
                    rule.state,
                    flag,
                    rule.spec(),
                    error
                );
            }
        }
    }
    Ok(())
}

async fn run_lease_action(engine: &Engine, action: LeaseAction) -> Result<()> {
    match action {
        LeaseAction::Set { name, mac, ip } => {
            validate_pool_membership(
                engine.settings.dhcp_pool_start,
                engine.settings.dhcp_pool_end,
                ip,
            )
            .map_err(anyhow::Error::from)?;

            let lease = engine
                .store
                .add_lease(NewLease {
                    container_name: name,
                    mac_address: mac,
                    ip_address: ip,
                })
                .await
                .map_err(anyhow::Error::from)?;
            println!("set lease {} -> {}", lease.container_name, lease.ip_address);

            let report = engine.dhcp.reconcile().await?;
            println!("{}", report);
        }
        LeaseAction::Remove { name } => {
            engine
                .store
                .remove_lease(&name)
                .await
                .map_err(anyhow::Error::from)?;
            let report = engine.dhcp.reconcile().await?;
            println!("{}", report);
        }
        LeaseAction::List => {
            for lease in engine.store.list_all_leases().await {
                let flag = if lease.deleted { " (deleting)" } else { "" };
                let error = lease
                    .last_error
                    .as_deref()
                    .map(|e| format!(" [{}]", e))
                    .unwrap_or_default();
                println!(
                    "{:<16}  {:<9}{}  {} {}{}",
                    lease.container_name,
                    lease.state,
                    flag,
                    lease.mac_address,
                    lease.ip_address,
                    error
                );
            }
        }
    }
    Ok(())
}

/// Parse "IP:PORT" destination specs.
fn split_destination(dest: &str) -> Result<(Ipv4Addr, u16)> {
    let (ip_str, port_str) = dest
        .trim()
        .rsplit_once(':')
        .context("destination must be IP:PORT")?;
    let ip = ip_str.parse().context("invalid destination IP address")?;
    let port = port_str.parse().context("invalid destination port")?;
    Ok((ip, port))
}

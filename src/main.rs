use clap::{Parser, Subcommand};
use meshnode::config::{self, Config};
use meshnode::error::AppError;
use meshnode::mesh_network::MeshNetwork;
use meshnode::node::{ProvisionedNode, ProvisioningResult};
use meshnode::snapshot::NodeSnapshot;
use meshnode::storage::{NodeStore, SledNodeStore};
use meshnode::{crypto, Key128, NodeKey};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "meshnode")]
#[command(about = "Provisioned mesh node records", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "meshnode.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config file and exit
    GenerateConfig,

    /// Record a freshly provisioned device with random device/network keys
    Provision {
        #[arg(long)]
        name: String,

        #[arg(long, default_value_t = 1)]
        elements: u8,

        /// Unicast base address (hex); the lowest free range is used when omitted
        #[arg(long)]
        unicast: Option<String>,

        /// Network key (hex); random when omitted
        #[arg(long)]
        net_key: Option<String>,

        #[arg(long, default_value_t = 0)]
        net_key_index: u16,
    },

    /// List stored nodes
    List,

    /// Show one node
    Show { uuid: String },

    /// Export a node snapshot as JSON
    Export {
        uuid: String,

        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Import a JSON snapshot; older schemas are migrated on the way in
    Import { file: PathBuf },

    /// Print NID, encryption, privacy and identity keys and network ID for a network key
    DeriveKeys { net_key: String },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Command::GenerateConfig = args.command {
        let mut config = Config::default();
        config.node.network_id = Uuid::new_v4().to_string();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = match Config::load_or_create(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = setup_logging(&config.logging, args.verbose);

    tracing::debug!("meshnode v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args.command, &config).await {
        tracing::error!("{}", e);
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, config: &Config) -> Result<(), AppError> {
    let store = open_store(config)?;
    let network_id = config.network_id();

    match command {
        Command::GenerateConfig => Ok(()),
        Command::Provision {
            name,
            elements,
            unicast,
            net_key,
            net_key_index,
        } => {
            let mut network = load_network(store.as_ref(), network_id).await?;

            let unicast_address = match unicast {
                Some(hex_addr) => parse_hex_u16(&hex_addr)?,
                None => network
                    .next_available_unicast(elements)
                    .map(|a| a.value())
                    .ok_or_else(|| {
                        AppError::InvalidArgument(format!(
                            "no free unicast range for {} element(s)",
                            elements
                        ))
                    })?,
            };
            let network_key = match net_key {
                Some(hex_key) => Key128::from_hex(&hex_key)?,
                None => Key128::random(),
            };

            let node = ProvisionedNode::new(
                network_id,
                ProvisioningResult {
                    device_uuid: Uuid::new_v4(),
                    node_name: name,
                    network_key,
                    net_key_index,
                    device_key: Key128::random(),
                    unicast_address,
                    element_count: elements,
                    ttl: config.node.default_ttl,
                    flags: 0,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    configuration_src: None,
                },
            )?;

            network.add_node(node.clone())?;
            store.save(&node).await?;

            println!("✅ Provisioned {}", node.identity().device_uuid());
            print_node(&node);
            Ok(())
        }
        Command::List => {
            let keys = store.list().await?;
            if keys.is_empty() {
                println!("No nodes stored");
            }
            for key in keys {
                match store.load(&key).await? {
                    Some(node) => println!(
                        "{}  {}  {}..={}  {}",
                        key.device_uuid,
                        key.network_id,
                        node.identity().unicast_address(),
                        node.identity().last_address(),
                        node.name()
                    ),
                    None => println!("{}  (missing)", key.device_uuid),
                }
            }
            Ok(())
        }
        Command::Show { uuid } => {
            let node = load_node(store.as_ref(), network_id, &uuid).await?;
            print_node(&node);
            Ok(())
        }
        Command::Export { uuid, out } => {
            let node = load_node(store.as_ref(), network_id, &uuid).await?;
            let json = node.snapshot().to_json()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("✅ Exported {} to {}", uuid, path.display());
                }
                None => println!("{}", json),
            }
            Ok(())
        }
        Command::Import { file } => {
            let json = std::fs::read_to_string(&file)?;
            let snapshot = NodeSnapshot::from_json(&json)?;
            let from_version = snapshot.version;
            let node = snapshot.restore()?;
            store.save(&node).await?;

            if from_version < meshnode::constants::snapshot::CURRENT_SCHEMA {
                println!("🔧 Upgraded record from schema v{}", from_version);
            }
            println!("✅ Imported {}", node.key());
            Ok(())
        }
        Command::DeriveKeys { net_key } => {
            let key = Key128::from_hex(&net_key)?;
            let material =
                crypto::derive_transport_keys(&key, &meshnode::constants::keys::K2_MASTER_INPUT);
            println!("NID:            {:#04x}", material.nid);
            println!("Encryption key: {}", material.encryption_key.to_hex());
            println!("Privacy key:    {}", material.privacy_key.to_hex());
            println!("Network ID:     {}", hex::encode(crypto::k3(&key)));
            println!("Identity key:   {}", crypto::identity_key(&key).to_hex());
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<Box<dyn NodeStore>, AppError> {
    if !config.storage.is_persistent() {
        return Err(AppError::Config(format!(
            "storage backend '{}' keeps nothing between runs; use 'sled'",
            config.storage.backend
        )));
    }

    let path = config.storage.nodes_path();
    let path = path
        .to_str()
        .ok_or_else(|| AppError::Config(format!("non-UTF-8 path {}", path.display())))?;
    Ok(Box::new(SledNodeStore::new(path)?))
}

async fn load_network(store: &dyn NodeStore, network_id: Uuid) -> Result<MeshNetwork, AppError> {
    let mut network = MeshNetwork::new(network_id, "default");
    for key in store.list().await? {
        if key.network_id != network_id {
            continue;
        }
        if let Some(node) = store.load(&key).await? {
            network.add_node(node)?;
        }
    }
    Ok(network)
}

async fn load_node(
    store: &dyn NodeStore,
    network_id: Uuid,
    uuid: &str,
) -> Result<ProvisionedNode, AppError> {
    let device_uuid = Uuid::parse_str(uuid)
        .map_err(|e| AppError::InvalidArgument(format!("invalid uuid '{}': {}", uuid, e)))?;
    let key = NodeKey {
        network_id,
        device_uuid,
    };
    store
        .load(&key)
        .await?
        .ok_or_else(|| AppError::InvalidArgument(format!("node {} not found", key)))
}

fn parse_hex_u16(value: &str) -> Result<u16, AppError> {
    let trimmed = value.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(trimmed, 16)
        .map_err(|e| AppError::InvalidArgument(format!("invalid address '{}': {}", value, e)))
}

fn print_node(node: &ProvisionedNode) {
    let identity = node.identity();
    println!("Name:        {}", node.name());
    println!("Device UUID: {}", identity.device_uuid());
    println!(
        "Addresses:   {}..={} ({} element(s))",
        identity.unicast_address(),
        identity.last_address(),
        identity.element_count()
    );
    println!("TTL:         {}", identity.ttl());
    println!("Configured:  {}", node.is_configured());

    for net_key in node.keys().network_keys() {
        let nid = node
            .transport_keys_for(net_key.index)
            .map(|m| format!("{:#04x}", m.nid))
            .unwrap_or_else(|| "-".to_string());
        println!("NetKey {:>4}: NID {}", net_key.index, nid);
    }
    for app_key in node.keys().application_keys() {
        println!(
            "AppKey {:>4}: bound to NetKey {}",
            app_key.index, app_key.bound_net_key_index
        );
    }

    if let Some(info) = node.composition() {
        println!(
            "Composition: CID {:#06x} PID {:#06x} VID {:#06x} CRPL {}",
            info.company_identifier, info.product_identifier, info.version_identifier, info.crpl
        );
    }
    for element in node.ordered_elements() {
        println!("Element {}:", element.address);
        for model in element.models.values() {
            match model.bound_app_key {
                Some(index) => println!("  model {} → AppKey {}", model.id, index),
                None => println!("  model {}", model.id),
            }
        }
    }
    println!("Received seq:   {:#08x}", node.received_sequence_number());
    println!("Replay records: {}", node.replay().len());
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if config.output == "file" {
        let path = Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| "meshnode.log".into());
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("⚠️ Failed to create log directory {}: {}", dir.display(), e);
        }

        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
        let builder = fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false);
        match config.format.as_str() {
            "json" => builder.json().init(),
            _ => builder.compact().init(),
        }
        return Some(guard);
    }

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    None
}

// Custom timer that shows UTC time and hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();

        // Format: "YYYY-MM-DD HH:MM:SS.mmm [hostname]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}

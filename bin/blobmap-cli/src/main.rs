//! blobmap CLI - Cluster map inspection tool
//!
//! Loads a static layout (JSON) and an optional TOML config, then answers
//! cluster map queries against it. `verify` replays the layout through an
//! in-process coordination service and cross-checks the two views.

use anyhow::{Context, Result, bail};
use blobmap_clustermap::{
    CheckedOperation, ClusterMap, CompositeClusterManager, DynamicClusterManager,
    InMemoryCoordinator, StaticClusterManager, StaticLayout, encode_partition_id,
};
use blobmap_common::{ClusterMapConfig, Config, DatacenterConfig};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blobmap-cli")]
#[command(about = "blobmap cluster map CLI")]
#[command(version)]
struct Args {
    /// Static cluster layout (JSON)
    #[arg(short, long, env = "BLOBMAP_LAYOUT")]
    layout: String,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/blobmap/blobmap.toml")]
    config: String,

    /// Local datacenter name (overrides config)
    #[arg(long)]
    datacenter: Option<String>,

    /// Transaction id floor (overrides config)
    #[arg(long)]
    current_xid: Option<i64>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List data nodes
    Nodes,
    /// List partitions
    Partitions {
        /// Restrict to a partition class
        #[arg(long)]
        class: Option<String>,
        /// Only read-write partitions
        #[arg(long)]
        writable: bool,
    },
    /// List the replicas hosted on a node
    Replicas {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long)]
        port: u16,
    },
    /// Print metrics in Prometheus text format
    Metrics,
    /// Encode a partition id as hex
    Encode {
        /// Partition id
        id: u64,
    },
    /// Decode a hex partition identifier
    Decode {
        /// Hex-encoded identifier
        hex: String,
    },
    /// Replay the layout through the coordination path and cross-check
    Verify,
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)?;
    toml::from_str(&config_str).with_context(|| format!("Failed to parse config file {path}"))
}

fn load_layout(path: &str) -> Result<StaticLayout> {
    let layout_str =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read layout {path}"))?;
    let layout: StaticLayout = serde_json::from_str(&layout_str)
        .with_context(|| format!("Failed to parse layout {path}"))?;
    layout.validate()?;
    Ok(layout)
}

/// Config for replaying `layout`: one in-process datacenter per layout datacenter
fn replay_config(base: &ClusterMapConfig, layout: &StaticLayout) -> ClusterMapConfig {
    let datacenters: Vec<DatacenterConfig> = layout
        .datacenters
        .iter()
        .map(|dc| DatacenterConfig {
            name: dc.name.clone(),
            id: dc.id,
            coordination_endpoint: base
                .datacenter(&dc.name)
                .map_or_else(|| format!("inmemory:{}", dc.name), |c| c.coordination_endpoint.clone()),
        })
        .collect();
    let datacenter_name = if datacenters.iter().any(|dc| dc.name == base.datacenter_name) {
        base.datacenter_name.clone()
    } else {
        datacenters
            .first()
            .map_or_else(|| base.datacenter_name.clone(), |dc| dc.name.clone())
    };
    ClusterMapConfig {
        cluster_name: layout.cluster_name.clone(),
        datacenter_name,
        datacenters,
        ..base.clone()
    }
}

fn build_composite(config: &ClusterMapConfig, layout: &StaticLayout) -> Result<CompositeClusterManager> {
    let config = replay_config(config, layout);
    let coordinator = InMemoryCoordinator::new(&config.cluster_name);
    for dc in &config.datacenters {
        coordinator.add_datacenter(&dc.name, &dc.coordination_endpoint);
    }
    for (dc, records) in layout.to_instance_records(None) {
        coordinator.upsert_records(&dc, records)?;
    }

    let static_map = StaticClusterManager::new(&config, layout)?;
    let dynamic = DynamicClusterManager::new(config, &coordinator)?;
    Ok(CompositeClusterManager::new(Arc::new(static_map), Arc::new(dynamic)))
}

/// Run every cross-checked query once
fn replay_queries(map: &CompositeClusterManager, layout: &StaticLayout) -> Result<()> {
    for dc in &layout.datacenters {
        map.has_datacenter(&dc.name);
    }
    let mut classes: Vec<Option<&str>> = vec![None];
    for partition in &layout.partitions {
        let class = Some(partition.partition_class.as_str());
        if !classes.contains(&class) {
            classes.push(class);
        }
    }
    for class in classes {
        map.get_all_partition_ids(class);
        map.get_writable_partition_ids(class);
    }
    for node in map.get_data_node_ids() {
        map.get_data_node_id(node.hostname(), node.port());
        map.get_replica_ids(&node)?;
    }
    for partition in map.get_all_partition_ids(None) {
        let encoded = partition.to_bytes();
        map.get_partition_id_from_stream(&mut &encoded[..])?;
    }
    Ok(())
}

fn print_nodes(map: &dyn ClusterMap) {
    let nodes = map.get_data_node_ids();
    println!("Data Nodes");
    println!("==========");
    if nodes.is_empty() {
        println!("No nodes found");
        return;
    }
    println!("{:<32} {:<12} {:<12} {:<10}", "INSTANCE", "DATACENTER", "RACK", "STATE");
    println!("{}", "-".repeat(68));
    for node in nodes {
        println!(
            "{:<32} {:<12} {:<12} {:<10}",
            node.instance_name(),
            node.datacenter(),
            node.rack_id().unwrap_or("-"),
            node.state()
        );
    }
}

fn print_partitions(map: &dyn ClusterMap, class: Option<&str>, writable: bool) {
    let partitions = if writable {
        map.get_writable_partition_ids(class)
    } else {
        map.get_all_partition_ids(class)
    };
    println!("Partitions");
    println!("==========");
    if partitions.is_empty() {
        println!("No partitions found");
        return;
    }
    println!("{:<12} {:<28} {:<12} {:<8}", "ID", "CLASS", "STATE", "REPLICAS");
    println!("{}", "-".repeat(64));
    for partition in &partitions {
        println!(
            "{:<12} {:<28} {:<12} {:<8}",
            partition.id(),
            partition.partition_class(),
            partition.state(),
            partition.replica_count()
        );
    }
    println!();
    println!("Total: {}", partitions.len());
}

fn print_replicas(map: &dyn ClusterMap, host: &str, port: u16) -> Result<()> {
    let Some(node) = map.get_data_node_id(host, port) else {
        bail!("No data node at {host}:{port}");
    };
    let replicas = map.get_replica_ids(&node)?;
    println!("Replicas on {node}");
    println!("=============={}", "=".repeat(node.instance_name().as_str().len()));
    println!("{:<12} {:<32} {:<8} {:<8}", "PARTITION", "PATH", "SEALED", "STOPPED");
    println!("{}", "-".repeat(62));
    for replica in replicas {
        println!(
            "{:<12} {:<32} {:<8} {:<8}",
            replica.partition_id(),
            replica.replica_path(),
            replica.is_sealed(),
            replica.is_stopped()
        );
    }
    Ok(())
}

fn decode(map: &dyn ClusterMap, encoded: &str) -> Result<()> {
    let bytes = hex::decode(encoded.trim()).context("Identifier is not valid hex")?;
    let partition = map.get_partition_id_from_stream(&mut bytes.as_slice())?;
    println!("Partition: {}", partition.id());
    println!("Class:     {}", partition.partition_class());
    println!("State:     {}", partition.state());
    println!("Replicas:  {}", partition.replica_count());
    Ok(())
}

fn verify(config: &ClusterMapConfig, layout: &StaticLayout) -> Result<()> {
    let map = build_composite(config, layout)?;
    replay_queries(&map, layout)?;

    println!("Consistency Check");
    println!("=================");
    for operation in CheckedOperation::ALL {
        println!("{:<32} {}", operation.as_str(), map.mismatches().get(operation));
    }
    let total = map.mismatches().total();
    map.close();
    if total > 0 {
        bail!("{total} mismatches between the static and dynamic cluster maps");
    }
    println!();
    println!("No mismatches");
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let mut config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(datacenter) = args.datacenter {
        config.cluster_map.datacenter_name = datacenter;
    }
    if let Some(xid) = args.current_xid {
        config.cluster_map.current_xid = xid;
    }
    let log_level = args.log_level.unwrap_or(config.logging.level);

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let layout = load_layout(&args.layout)?;
    info!(
        "Loaded layout {} v{} ({} datacenters, {} partitions)",
        layout.cluster_name,
        layout.version,
        layout.datacenters.len(),
        layout.partitions.len()
    );
    if layout.cluster_name != config.cluster_map.cluster_name {
        warn!(
            "Layout cluster {} differs from configured cluster {}",
            layout.cluster_name, config.cluster_map.cluster_name
        );
    }

    match args.command {
        Commands::Nodes => print_nodes(&StaticClusterManager::new(&config.cluster_map, &layout)?),
        Commands::Partitions { class, writable } => print_partitions(
            &StaticClusterManager::new(&config.cluster_map, &layout)?,
            class.as_deref(),
            writable,
        ),
        Commands::Replicas { host, port } => print_replicas(
            &StaticClusterManager::new(&config.cluster_map, &layout)?,
            &host,
            port,
        )?,
        Commands::Metrics => {
            let map = StaticClusterManager::new(&config.cluster_map, &layout)?;
            print!("{}", map.export_metrics());
        }
        Commands::Encode { id } => println!("{}", hex::encode(encode_partition_id(id))),
        Commands::Decode { hex } => {
            decode(&StaticClusterManager::new(&config.cluster_map, &layout)?, &hex)?;
        }
        Commands::Verify => verify(&config.cluster_map, &layout)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LAYOUT: &str = r#"{
        "cluster_name": "blobmap",
        "version": 3,
        "datacenters": [
            {
                "name": "DC0",
                "id": 0,
                "nodes": [
                    {"hostname": "host0", "port": 6667, "disks": [{"mount_path": "/mnt0", "capacity_bytes": 1024}]},
                    {"hostname": "host1", "port": 6667, "disks": [{"mount_path": "/mnt0", "capacity_bytes": 1024}]}
                ]
            },
            {
                "name": "DC1",
                "id": 1,
                "nodes": [
                    {"hostname": "host2", "port": 6667, "disks": [{"mount_path": "/mnt0", "capacity_bytes": 1024}]}
                ]
            }
        ],
        "partitions": [
            {
                "id": 7,
                "replicas": [
                    {"hostname": "host0", "port": 6667, "mount_path": "/mnt0"},
                    {"hostname": "host2", "port": 6667, "mount_path": "/mnt0"}
                ]
            },
            {
                "id": 8,
                "partition_class": "special",
                "state": "READ_ONLY",
                "replicas": [
                    {"hostname": "host1", "port": 6667, "mount_path": "/mnt0"}
                ]
            }
        ]
    }"#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_layout() {
        let file = write_temp(LAYOUT);
        let layout = load_layout(file.path().to_str().unwrap()).unwrap();
        assert_eq!(layout.version, 3);
        assert_eq!(layout.datacenters.len(), 2);
        assert_eq!(layout.partitions.len(), 2);
    }

    #[test]
    fn test_load_invalid_layout() {
        let file = write_temp("{\"cluster_name\": ");
        assert!(load_layout(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_load_config_toml() {
        let file = write_temp(
            r#"
[cluster_map]
cluster_name = "blobmap"
datacenter_name = "DC1"
fixed_timeout_datanode_error_threshold = 5

[logging]
level = "debug"
"#,
        );
        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.cluster_map.datacenter_name, "DC1");
        assert_eq!(config.cluster_map.thresholds().datanode, 5);
        assert_eq!(config.cluster_map.default_partition_class, "default");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config("/nonexistent/blobmap.toml").unwrap();
        assert_eq!(config.cluster_map.cluster_name, "blobmap");
    }

    #[test]
    fn test_replay_has_no_mismatches() {
        let layout: StaticLayout = serde_json::from_str(LAYOUT).unwrap();
        let map = build_composite(&ClusterMapConfig::default(), &layout).unwrap();
        replay_queries(&map, &layout).unwrap();
        assert_eq!(map.mismatches().total(), 0);
        assert_eq!(map.get_data_node_ids().len(), 3);
        assert_eq!(map.get_writable_partition_ids(None).len(), 1);
        assert_eq!(map.get_all_partition_ids(Some("special")).len(), 1);
        map.close();
    }

    #[test]
    fn test_replay_config_uses_layout_datacenters() {
        let layout: StaticLayout = serde_json::from_str(LAYOUT).unwrap();
        let base = ClusterMapConfig {
            datacenter_name: "DC9".into(),
            ..ClusterMapConfig::default()
        };
        let config = replay_config(&base, &layout);
        assert_eq!(config.datacenters.len(), 2);
        assert_eq!(config.datacenter_name, "DC0");
        assert_eq!(config.datacenters[0].coordination_endpoint, "localhost:2199");
        assert_eq!(config.datacenters[1].coordination_endpoint, "inmemory:DC1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_decode_unknown_partition() {
        let layout: StaticLayout = serde_json::from_str(LAYOUT).unwrap();
        let map = StaticClusterManager::new(&ClusterMapConfig::default(), &layout).unwrap();
        assert!(decode(&map, &hex::encode(encode_partition_id(7))).is_ok());
        assert!(decode(&map, &hex::encode(encode_partition_id(99))).is_err());
        assert!(decode(&map, "zz").is_err());
    }
}

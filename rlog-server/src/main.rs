use anyhow::{bail, Context, Result};
use clap::Parser;
use rlog_common::config::load_config;
use rlog_common::types::ClusterConfig;
use rlog_storage::paxos::cluster::ClusterState;
use rlog_storage::paxos::retry::ExponentialBackoff;
use rlog_storage::paxos::state_machine::KvCommand;
use rlog_storage::paxos::transport::{LocalNetwork, NetworkModel};
use rlog_storage::{KeyValueStore, Node};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Runs a replicated key-value store cluster inside one process
#[derive(Parser, Debug)]
#[command(name = "rlog-server")]
struct Args {
    /// Cluster configuration file (JSON); overrides --nodes
    #[arg(long)]
    config: Option<String>,

    /// Number of local nodes when no config file is given
    #[arg(long, default_value = "3")]
    nodes: u8,

    /// Number of set commands to replicate
    #[arg(long, default_value = "20")]
    commands: u64,

    /// Probability that a message is dropped
    #[arg(long, default_value = "0.0")]
    drop_rate: f64,

    /// Upper bound of the simulated network delay
    #[arg(long, default_value = "5")]
    max_delay_ms: u64,

    /// Pause between catch-up rounds of each node
    #[arg(long, default_value = "200")]
    update_interval_ms: u64,

    /// Seed of the simulated network
    #[arg(long, default_value = "42")]
    seed: u64,
}

type KvNode = Node<KeyValueStore>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = match &args.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path))?,
        None => {
            let config = ClusterConfig::local(args.nodes);
            config.validate()?;
            config
        }
    };
    if !(0.0..1.0).contains(&args.drop_rate) {
        bail!("drop rate must be in [0, 1), got {}", args.drop_rate);
    }

    let model = NetworkModel {
        drop_rate: args.drop_rate,
        min_delay: Duration::ZERO,
        max_delay: Duration::from_millis(args.max_delay_ms),
    };
    let network = LocalNetwork::new(model, args.seed);
    let cluster = ClusterState::from(&config);
    let nodes: Vec<Arc<KvNode>> = config
        .nodes
        .iter()
        .map(|member| {
            let address = member.address();
            let node = Arc::new(Node::new(
                member.node_id,
                network.router_for(address.clone()),
                cluster.clone(),
                KeyValueStore::default(),
            ));
            network.register(address, node.clone());
            node
        })
        .collect();

    info!(
        nodes = nodes.len(),
        commands = args.commands,
        drop_rate = args.drop_rate,
        "cluster started"
    );

    let shutdown = CancellationToken::new();
    let mut updaters = JoinSet::new();
    for node in &nodes {
        updaters.spawn(run_updates(
            Arc::clone(node),
            Duration::from_millis(args.update_interval_ms),
            shutdown.clone(),
        ));
    }

    // 1. Drive the workload, one proposer task per node
    let mut workers = JoinSet::new();
    for (index, node) in nodes.iter().enumerate() {
        let node = Arc::clone(node);
        let (stride, count) = (nodes.len() as u64, args.commands);
        workers.spawn(async move {
            let mut applied = 0u64;
            for i in (index as u64..count).step_by(stride as usize) {
                // versions grow with i, so a late command for a key may lose
                let command =
                    KvCommand::set(format!("key_{}", i % 4), i + 1, format!("value_{}", i));
                if propose_and_wait(&node, command).await? {
                    applied += 1;
                }
            }
            anyhow::Ok(applied)
        });
    }
    let mut applied = 0u64;
    while let Some(joined) = workers.join_next().await {
        applied += joined??;
    }

    // 2. Let every node catch up over a quiet network
    network.set_model(NetworkModel::RELIABLE);
    let ctx = CancellationToken::new();
    for node in &nodes {
        node.update(&ctx).await?;
    }
    shutdown.cancel();
    while updaters.join_next().await.is_some() {}

    // 3. Report
    for node in &nodes {
        let value = node.value();
        let entries = node.with_state_machine(|kv| kv.entries());
        info!(
            node = %node.node_id(),
            start_id = value.start_id,
            decided_id = value.decided_id,
            keys = entries.len(),
            "final state"
        );
        for (key, entry) in entries {
            info!(
                node = %node.node_id(),
                %key,
                version = entry.version,
                value = %entry.value,
                "entry"
            );
        }
    }
    info!(applied, proposed = args.commands, "done");
    Ok(())
}

/// Proposes `command` and waits until the local store applied or rejected it.
async fn propose_and_wait(node: &KvNode, command: KvCommand) -> Result<bool> {
    let uuid = command.uuid;
    let outcome = node.with_state_machine(|kv| kv.watch(uuid));
    let mut retry =
        ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(500), 2.0)?;
    node.propose(&CancellationToken::new(), command.encode()?, &mut retry)
        .await?;

    match tokio::time::timeout(Duration::from_secs(10), outcome).await {
        Ok(Ok(applied)) => Ok(applied),
        Ok(Err(_)) => bail!("watcher for {} dropped", uuid),
        Err(_) => {
            node.with_state_machine(|kv| kv.unwatch(&uuid));
            warn!(node = %node.node_id(), %uuid, "command not applied locally in time");
            Ok(false)
        }
    }
}

async fn run_updates(node: Arc<KvNode>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                match node.update(&shutdown).await {
                    Err(_) if shutdown.is_cancelled() => return,
                    Err(err) => warn!(node = %node.node_id(), %err, "update failed"),
                    Ok(()) => {}
                }
            }
        }
    }
}

//! Murmur Node -- cluster membership and liveness daemon.
//!
//! Usage:
//!   murmur-node                      # Run with default config
//!   murmur-node --config path.toml   # Run with custom config
//!   murmur-node status               # Query the local node

use clap::{Parser, Subcommand};
use murmur_gossip::{AllMembersRing, FeatureListener, Gossiper, NetHandle};
use murmur_node::config::NodeConfig;
use murmur_node::transport::GossipTransport;
use murmur_node::{choose_generation, expand_tilde, load_or_create_token};
use murmur_protocol::state::AppStateKey;
use murmur_storage::{SqliteSystemStore, SystemStore};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "murmur-node", about = "Murmur cluster membership node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.murmur/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node status (queries the local API)
    Status,
    /// List known endpoints with their gossip state
    Endpoints,
    /// Forcibly remove an endpoint after the verification wait
    Assassinate {
        /// Endpoint address (ip:port)
        endpoint: SocketAddr,
    },
    /// Forcibly remove an endpoint without waiting
    Remove {
        /// Endpoint address (ip:port)
        endpoint: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_node=info,murmur_gossip=info,murmur_api=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg).await,
        Some(Commands::Status) => cli_api_call(&cfg, "/api/v1/status", "{}").await,
        Some(Commands::Endpoints) => cli_api_call(&cfg, "/api/v1/endpoints", "{}").await,
        Some(Commands::Assassinate { endpoint }) => {
            let body = serde_json::json!({ "endpoint": endpoint }).to_string();
            cli_api_call(&cfg, "/api/v1/assassinate", &body).await
        }
        Some(Commands::Remove { endpoint }) => {
            let body = serde_json::json!({ "endpoint": endpoint }).to_string();
            cli_api_call(&cfg, "/api/v1/remove", &body).await
        }
    }
}

/// POST to the local node API and print the JSON response.
async fn cli_api_call(cfg: &NodeConfig, path: &str, body: &str) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde("~/.murmur/node-token");
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", token))
        .body(body.to_string())
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
        Ok(())
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let listen_addr: SocketAddr = cfg.node.listen_addr.parse()?;

    // Persistence hook: generation counter + saved peer features.
    let db_path = expand_tilde(&cfg.node.database);
    let store: Arc<dyn SystemStore> = Arc::new(SqliteSystemStore::open(&db_path)?);
    let generation = choose_generation(store.as_ref(), cfg.gossip.force_gossip_generation)?;

    // Transport first: the advertised address needs the bound port.
    let transport = GossipTransport::new(listen_addr).map_err(|e| anyhow::anyhow!(e))?;
    let bound = transport.local_addr()?;
    let advertise_addr: SocketAddr = match &cfg.node.advertise_addr {
        Some(addr) => addr.parse()?,
        None => {
            if bound.ip().is_unspecified() {
                anyhow::bail!(
                    "listening on a wildcard address requires node.advertise_addr to be set"
                );
            }
            bound
        }
    };

    tracing::info!(
        cluster = %cfg.node.cluster_name,
        listen = %bound,
        advertise = %advertise_addr,
        generation,
        seeds = cfg.gossip.seeds.len(),
        version = env!("CARGO_PKG_VERSION"),
        "starting murmur-node"
    );

    let (net, net_rx) = NetHandle::channel(256);
    let gossiper = Gossiper::new(
        cfg.gossip_config(),
        advertise_addr,
        net,
        Arc::new(AllMembersRing),
    );

    // Feature negotiation: persist peer features, warm-start saved peers.
    let features = FeatureListener::new(store.clone());
    gossiper.register(features.clone()).await;
    for (peer, saved) in features.load_saved().await? {
        gossiper.add_saved_endpoint(peer, Some(saved)).await;
    }

    // Transport loops.
    let (net_shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let outbound_handle = tokio::spawn(
        transport
            .clone()
            .run_outbound(net_rx, net_shutdown_tx.subscribe()),
    );
    let accept_handle = tokio::spawn(
        transport
            .clone()
            .run_accept(gossiper.clone(), net_shutdown_tx.subscribe()),
    );

    // Learn the cluster's view before joining.
    let contacts: Vec<SocketAddr> = cfg
        .seed_addrs()
        .into_iter()
        .filter(|a| *a != advertise_addr)
        .collect();
    if !contacts.is_empty() {
        gossiper
            .do_shadow_round(contacts)
            .await
            .map_err(|e| anyhow::anyhow!("cannot join the cluster: {e}"))?;
    }

    // Join.
    let preload = vec![
        (AppStateKey::Status, "NORMAL".to_string()),
        (
            AppStateKey::HostId,
            format!("{advertise_addr}/{generation}"),
        ),
        (
            AppStateKey::SupportedFeatures,
            cfg.gossip.features.join(","),
        ),
    ];
    gossiper
        .start_gossiping(generation, preload, true)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start gossiping: {e}"))?;

    gossiper.wait_for_gossip_to_settle().await;
    tracing::info!(
        features = ?features.cluster_features().await,
        "cluster-common features"
    );

    // Admin API.
    let token_path = expand_tilde("~/.murmur/node-token");
    let bearer_token = load_or_create_token(&token_path)?;
    let state = Arc::new(murmur_api::AppState {
        gossiper: gossiper.clone(),
        bearer_token,
        start_time: std::time::Instant::now(),
        cluster_name: cfg.node.cluster_name.clone(),
    });
    let router = murmur_api::router(state);
    let api_listener = tokio::net::TcpListener::bind(&cfg.node.api_addr).await?;
    tracing::info!(addr = %cfg.node.api_addr, "API listening");
    let mut api_shutdown = net_shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        axum::serve(api_listener, router)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.recv().await;
            })
            .await
            .ok();
    });

    // The RPC surface is up; let the cluster know.
    gossiper
        .add_local_application_state(AppStateKey::RpcReady, "true".into())
        .await
        .map_err(|e| anyhow::anyhow!("failed to publish RPC_READY: {e}"))?;

    tracing::info!("node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down...");
    gossiper.stop_gossiping().await;
    let _ = net_shutdown_tx.send(());
    let _ = tokio::join!(outbound_handle, accept_handle, api_handle);

    tracing::info!("shutdown complete");
    Ok(())
}

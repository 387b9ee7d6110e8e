//! OCPP Mesh Node - gateway CLI
//!
//! Terminates WebSocket links from stations and other gateways, dials its
//! upstream neighbors and relays OCPP calls between them.
//!
//! # Usage
//!
//! ```bash
//! # CSMS-side node accepting links
//! ocpp-mesh-node --name CSMS --listen 0.0.0.0:9000
//!
//! # Gateway dialing the CSMS, reaching CS001 through GW02
//! ocpp-mesh-node --name GW01 --listen 0.0.0.0:9001 \
//!     --upstream CSMS=ws://localhost:9000 --route CS001=GW02
//!
//! # Sign outbound Reset calls with a fixed key
//! ocpp-mesh-node --name CSMS --listen 0.0.0.0:9000 \
//!     --policy policy.json --key-id csms-root --signing-seed <base64 seed>
//! ```

mod handlers;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_mesh_core::{
    Dispatcher, DispatchEvent, InMemoryKeyStore, NetworkingMode, NetworkingNodeId, NodeConfig,
    RoutingTable, SignaturePolicy,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::transport::{Transport, Upstream};

/// OCPP mesh gateway node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identity in the mesh
    #[arg(short, long)]
    name: NetworkingNodeId,

    /// Address to accept links on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream neighbor as NODE=ws://host:port (can be repeated)
    #[arg(long)]
    upstream: Vec<Upstream>,

    /// Static route as DESTINATION=VIA (can be repeated)
    #[arg(long, value_parser = parse_route)]
    route: Vec<(NetworkingNodeId, NetworkingNodeId)>,

    /// Signature policy JSON file
    #[arg(long)]
    policy: Option<std::path::PathBuf>,

    /// Base64 32-byte Ed25519 seed for the local signing key
    #[arg(long, requires = "key_id")]
    signing_seed: Option<String>,

    /// Key id of the local signing key
    #[arg(long, requires = "signing_seed")]
    key_id: Option<String>,

    /// Trusted peer key as KEY_ID=BASE64_PUBLIC_KEY (can be repeated)
    #[arg(long, value_parser = parse_trust)]
    trust: Vec<(String, String)>,

    /// Default request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout_secs: u64,

    /// Plain OCPP-J framing; no relaying
    #[arg(long)]
    standard: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_route(s: &str) -> Result<(NetworkingNodeId, NetworkingNodeId), String> {
    let (destination, via) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DESTINATION=VIA, got {}", s))?;
    let destination = destination.trim().parse().map_err(|e| format!("{}", e))?;
    let via = via.trim().parse().map_err(|e| format!("{}", e))?;
    Ok((destination, via))
}

fn parse_trust(s: &str) -> Result<(String, String), String> {
    let (key_id, public) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY_ID=BASE64_PUBLIC_KEY, got {}", s))?;
    let key_id = key_id.trim();
    if key_id.is_empty() {
        return Err(format!("missing key id in {}", s));
    }
    Ok((key_id.to_string(), public.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mode = if args.standard {
        NetworkingMode::Standard
    } else {
        NetworkingMode::Overlay
    };

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                OCPP Mesh Node - Gateway                      ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name.as_str());
    println!("║  Mode:     {:<50} ║", format!("{:?}", mode));
    println!(
        "║  Listen:   {:<50} ║",
        args.listen.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!("║  Upstream: {:<50} ║", args.upstream.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = NodeConfig::new(args.name.clone())
        .with_networking_mode(mode)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs));

    let policy = match &args.policy {
        Some(path) => {
            let policy = SignaturePolicy::from_file(path)?;
            info!("Loaded {} signature policy entries from {}", policy.entries.len(), path.display());
            policy
        }
        None => SignaturePolicy::default(),
    };

    let keys = Arc::new(InMemoryKeyStore::new());
    if let (Some(seed), Some(key_id)) = (&args.signing_seed, &args.key_id) {
        keys.insert_seed_base64(key_id.as_str(), seed)?;
        info!("Signing key {} loaded", key_id);
    }
    for (key_id, public) in &args.trust {
        keys.insert_public_key_base64(key_id.as_str(), public)?;
        info!("Trusting key {}", key_id);
    }

    let routes = Arc::new(RoutingTable::new());
    for (destination, via) in &args.route {
        routes.add_route(destination.clone(), via.clone());
        info!("Static route {} via {}", destination, via);
    }

    let (dispatcher, incoming) = Dispatcher::builder(config)
        .routes(routes.clone())
        .key_provider(keys)
        .policy(policy)
        .actions(handlers::registry())
        .observer(log_event)
        .build();

    tokio::spawn(handlers::serve(args.name.clone(), incoming));

    let transport = Arc::new(Transport::new(dispatcher.clone(), routes));
    for upstream in args.upstream.clone() {
        tokio::spawn(transport.clone().dial(upstream));
    }

    let listener = args.listen.map(|addr| tokio::spawn(transport.clone().listen(addr)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let cancelled = dispatcher.shutdown();
    if cancelled > 0 {
        warn!("{} pending call(s) cancelled", cancelled);
    }
    if let Some(listener) = listener {
        listener.abort();
    }

    Ok(())
}

/// Log dispatcher events that are not already logged at the point they happen
fn log_event(event: &DispatchEvent) {
    match event {
        DispatchEvent::SyntheticError { frame } => info!("Answered locally: {}", frame.to_text()),
        DispatchEvent::SignatureRejected {
            message_id,
            action,
            reason,
        } => warn!("Signature rejected on {} {}: {}", action, message_id, reason),
        DispatchEvent::ResponseReceived {
            message_id,
            action,
            elapsed,
            success,
        } => info!("{} {} answered in {:?} (ok: {})", action, message_id, elapsed, success),
        _ => {}
    }
}

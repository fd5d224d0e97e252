//! Command-line client for ElectrumX servers.
//!
//! Connects to one server (the network's preset unless `--server` is
//! given), runs one command and exits. `watch` keeps running until
//! interrupted or until the server goes away.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bitcoin::Network;
use bitcoin::blockdata::constants::genesis_block;
use clap::{Parser, Subcommand};
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use elx_client::config::{ClientConfig, ServerAddr, parse_network};
use elx_client::electrumx::{HeaderNotification, ServerConn, ssl_peer_addrs};
use elx_client::subscriptions::{AddressEvent, AddressSynchronizer, SubscriptionRegistry};
use elx_client::tracing::{self, prelude::*};

/// Query and watch an ElectrumX server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network: mainnet, testnet or regtest
    #[arg(short, long, env = "ELX_NETWORK", default_value = "mainnet")]
    network: String,

    /// Server as tcp://host:port or ssl://host:port (default: network preset)
    #[arg(short, long, env = "ELX_SERVER")]
    server: Option<String>,

    /// SOCKS5 proxy host:port, e.g. 127.0.0.1:9050 for Tor
    #[arg(long, env = "ELX_PROXY")]
    proxy: Option<String>,

    /// Accept self-signed server certificates
    #[arg(long)]
    insecure: bool,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show server banner and features, and check the genesis hash
    Info,

    /// List the server's TLS-capable peers
    Peers {
        /// Include .onion peers
        #[arg(long)]
        onion: bool,
    },

    /// Print the block header at a height
    Header { height: u32 },

    /// Estimate the fee rate for confirmation within a number of blocks
    Fee {
        #[arg(default_value_t = 6)]
        blocks: u32,
    },

    /// Print the transaction history of an address
    History { address: String },

    /// Watch addresses and the chain tip, printing changes as they happen
    Watch {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_stdout();

    let args = Args::parse();
    let config = build_config(&args)?;

    let shutdown = CancellationToken::new();
    let conn = ServerConn::connect(&config.server.addr, config.connect_opts()?, &shutdown)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server))?;
    let conn = Arc::new(conn);
    info!(server = %config.server, proto = %conn.proto(), "Connected.");

    let cancel = CancellationToken::new();
    let result = match args.command {
        Command::Info => cmd_info(&conn, &cancel, config.network).await,
        Command::Peers { onion } => cmd_peers(&conn, &cancel, onion).await,
        Command::Header { height } => cmd_header(&conn, &cancel, height).await,
        Command::Fee { blocks } => cmd_fee(&conn, &cancel, blocks).await,
        Command::History { address } => {
            cmd_history(&conn, &cancel, config.network, &address).await
        }
        Command::Watch { addresses } => cmd_watch(conn.clone(), config.network, &addresses).await,
    };

    conn.shutdown();
    conn.done().await;
    result
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    let network = parse_network(&args.network)?;
    let mut config = match &args.server {
        Some(server) => ClientConfig::new(network, server.parse::<ServerAddr>()?),
        None => ClientConfig::for_network(network)?,
    };

    config.proxy = args.proxy.clone();
    config.accept_invalid_certs |= args.insecure;
    config.connect_timeout = Some(Duration::from_secs(args.timeout));
    Ok(config)
}

async fn cmd_info(conn: &ServerConn, cancel: &CancellationToken, network: Network) -> Result<()> {
    let banner = conn.banner(cancel).await?;
    let features = conn.features(cancel).await?;

    println!("Server:    {}", features.server_version);
    println!(
        "Protocol:  {} (server supports {}..{})",
        conn.proto(),
        features.protocol_min,
        features.protocol_max
    );
    println!("Hash:      {}", features.hash_function);
    println!("Genesis:   {}", features.genesis_hash);
    for (host, ports) in &features.hosts {
        let mut ports: Vec<_> = ports
            .iter()
            .filter_map(|(kind, port)| port.map(|p| format!("{}={}", kind, p)))
            .collect();
        ports.sort();
        println!("Host:      {} {}", host, ports.join(" "));
    }
    if !banner.is_empty() {
        println!();
        println!("{}", banner.trim_end());
    }

    let expected = genesis_block(network).block_hash().to_string();
    if features.genesis_hash != expected {
        bail!(
            "Server is on a different network: genesis {} (expected {} for {})",
            features.genesis_hash,
            expected,
            network
        );
    }
    Ok(())
}

async fn cmd_peers(conn: &ServerConn, cancel: &CancellationToken, onion: bool) -> Result<()> {
    let peers = conn.peers(cancel).await?;
    let addrs = ssl_peer_addrs(&peers, onion);

    for addr in &addrs.tls {
        println!("ssl://{}", addr);
    }
    for addr in &addrs.tcp_only_onion {
        println!("tcp://{}", addr);
    }
    info!(
        peers = peers.len(),
        usable = addrs.tls.len() + addrs.tcp_only_onion.len(),
        "Done."
    );
    Ok(())
}

async fn cmd_header(conn: &ServerConn, cancel: &CancellationToken, height: u32) -> Result<()> {
    let tip = HeaderNotification {
        height,
        hex: conn.block_header(cancel, height).await?,
    };
    print_header(&tip)
}

async fn cmd_fee(conn: &ServerConn, cancel: &CancellationToken, blocks: u32) -> Result<()> {
    let rate = conn.estimate_fee(cancel, blocks).await?;
    // Per 1000 vbytes, so sat/kvB / 1000 = sat/vB
    println!(
        "{} BTC/kvB ({:.1} sat/vB) for confirmation within {} blocks",
        rate.to_btc(),
        rate.to_sat() as f64 / 1000.0,
        blocks
    );
    Ok(())
}

async fn cmd_history(
    conn: &Arc<ServerConn>,
    cancel: &CancellationToken,
    network: Network,
    address: &str,
) -> Result<()> {
    let sync = AddressSynchronizer::new(conn.clone(), SubscriptionRegistry::new(network));
    let address = sync
        .parse_address(address)
        .with_context(|| format!("Invalid {} address {}", sync.network(), address))?;

    let history = sync.address_history(cancel, &address).await?;
    if history.is_empty() {
        println!("No transactions.");
    }
    for entry in history {
        match (entry.height, entry.fee) {
            (h, Some(fee)) if h <= 0 => println!("mempool  {} fee={} sat", entry.tx_hash, fee),
            (h, _) if h <= 0 => println!("mempool  {}", entry.tx_hash),
            (h, _) => println!("{:<8} {}", h, entry.tx_hash),
        }
    }
    Ok(())
}

async fn cmd_watch(conn: Arc<ServerConn>, network: Network, addresses: &[String]) -> Result<()> {
    let sync = Arc::new(AddressSynchronizer::new(
        conn.clone(),
        SubscriptionRegistry::new(network),
    ));
    let cancel = CancellationToken::new();

    let tip = conn.subscribe_headers(&cancel).await?;
    print_header(&tip)?;

    for address in addresses {
        let address = sync
            .parse_address(address)
            .with_context(|| format!("Invalid {} address {}", sync.network(), address))?;
        let status = sync.watch(&cancel, address.clone()).await?;
        println!("{} status {}", address, status.as_deref().unwrap_or("(no history)"));
    }

    let tracker = TaskTracker::new();
    let (event_tx, mut event_rx) = mpsc::channel(64);
    tracker.spawn({
        let sync = sync.clone();
        async move { sync.run(event_tx).await }
    });
    tracker.spawn({
        let headers = conn.headers_notify();
        async move {
            while let Some(tip) = headers.recv().await {
                if let Err(e) = print_header(&tip) {
                    warn!(error = %e, "Bad header notification");
                }
            }
        }
    });
    tracker.close();

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            event = event_rx.recv() => match event {
                Some(AddressEvent::StatusChanged { address, status }) => {
                    println!("{} status {}", address, status.as_deref().unwrap_or("(no history)"));
                    match sync.address_history(&cancel, &address).await {
                        Ok(history) => {
                            for entry in history {
                                println!("  {:<8} {}", entry.height, entry.tx_hash);
                            }
                        }
                        Err(e) if e.is_terminal() => return Err(e.into()),
                        Err(e) => warn!(address = %address, error = %e, "History query failed"),
                    }
                }
                Some(AddressEvent::Disconnected) | None => {
                    warn!("Server connection lost");
                    break;
                }
            },
        }
    }

    trace!("Shutting down.");
    conn.shutdown();
    tracker.wait().await;
    Ok(())
}

fn print_header(tip: &HeaderNotification) -> Result<()> {
    let header = tip.header()?;
    println!(
        "{:<8} {} time={} bits={:#x}",
        tip.height,
        header.block_hash(),
        header.time,
        header.bits.to_consensus()
    );
    Ok(())
}

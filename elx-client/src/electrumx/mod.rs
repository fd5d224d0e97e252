//! ElectrumX protocol client.
//!
//! This module provides a client for ElectrumX servers. The protocol is
//! JSON-RPC over TCP or TLS (optionally through a SOCKS5 proxy) with
//! newline-delimited messages.
//!
//! # Protocol Overview
//!
//! ElectrumX is a bidirectional, request/response protocol with push
//! notifications:
//!
//! - **Client requests**: server.*, blockchain.block.*, blockchain.transaction.*,
//!   blockchain.scripthash.*, blockchain.estimatefee
//! - **Server notifications**: blockchain.headers.subscribe (new chain tip),
//!   blockchain.scripthash.subscribe (address status changed)
//! - **Server responses**: Results for client requests, matched by id and
//!   arriving in any order
//!
//! # Architecture
//!
//! A [`ServerConn`] owns one socket. After the version handshake it runs
//! two tasks: a read loop that routes responses to their waiting callers
//! and notifications to the feeds, and a keepalive loop that pings the
//! server. Any number of tasks may issue requests concurrently through a
//! shared `Arc<ServerConn>`.
//!
//! A connection is single use. When it terminates, every pending request
//! fails with [`ElectrumError::Terminated`] and both feeds end; the
//! caller decides whether and where to reconnect.
//!
//! # Usage
//!
//! ```rust,ignore
//! use elx_client::electrumx::{ConnectOpts, Scripthash, ServerConn};
//!
//! let conn = ServerConn::connect("electrum.example.com:50002", opts, &shutdown).await?;
//!
//! let tip = conn.subscribe_headers(&cancel).await?;
//! let status = conn.subscribe_scripthash(&cancel, &Scripthash::for_address(&addr)).await?;
//!
//! let feed = conn.scripthash_notify();
//! while let Some(change) = feed.recv().await {
//!     // change.scripthash has a new status; fetch its history
//! }
//! ```

mod client;
mod connection;
mod error;
mod messages;
mod methods;
mod pending;
mod peers;
mod scripthash;

pub use client::{
    ConnState, ConnectOpts, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PING_INTERVAL, NotifyFeed,
    PROTOCOL_VERSION, ServerConn,
};
pub use connection::{join_host_port, split_host_port};
pub use error::{ElectrumError, ElectrumResult};
pub use messages::{HeaderNotification, Params, RpcError, ScripthashStatus};
pub use methods::{
    BlockHeaders, GetTransactionResult, HistoryEntry, PkScript, ServerFeatures, SigScript,
    UnspentOutput, Vin, Vout,
};
pub use peers::{PeerAddrs, PeerInfo, ssl_peer_addrs};
pub use scripthash::Scripthash;

#[cfg(test)]
pub(crate) use connection::FakeServer;

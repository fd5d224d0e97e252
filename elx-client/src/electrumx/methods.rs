//! Typed ElectrumX methods.
//!
//! Thin wrappers over [`ServerConn::request`] with the result shapes the
//! protocol documents. Every method takes a cancellation token that
//! abandons just that request.

use std::collections::HashMap;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::client::ServerConn;
use super::error::{ElectrumError, ElectrumResult};
use super::messages::{HEADERS_SUBSCRIBE, HeaderNotification, Params, SCRIPTHASH_SUBSCRIBE};
use super::peers::{PeerInfo, parse_peers};
use super::scripthash::Scripthash;

/// Result of `server.features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFeatures {
    /// Check this against the expected network before trusting anything
    /// else the server says.
    pub genesis_hash: String,

    /// e.g. `{"host.com": {"tcp_port": 51001, "ssl_port": 51002}}`; may be
    /// absent
    #[serde(default)]
    pub hosts: HashMap<String, HashMap<String, Option<u32>>>,

    pub protocol_max: String,
    pub protocol_min: String,

    /// Documented as an integer, seen as strings and null in the wild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruning: Option<Value>,

    /// Server software version, not the protocol version
    pub server_version: String,

    /// e.g. "sha256"
    pub hash_function: String,
}

/// Signature script of a transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigScript {
    pub asm: String,
    pub hex: String,
}

/// Input of a verbose transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vin {
    /// Absent for coinbase inputs
    #[serde(default)]
    pub txid: String,

    #[serde(default)]
    pub vout: u32,

    #[serde(rename = "scriptSig", alias = "scriptsig", default)]
    pub script_sig: Option<SigScript>,

    #[serde(rename = "txinwitness", default, skip_serializing_if = "Vec::is_empty")]
    pub witness: Vec<String>,

    pub sequence: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinbase: Option<String>,
}

/// Output script of a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkScript {
    pub asm: String,
    pub hex: String,

    #[serde(rename = "reqSigs", alias = "reqsigs", default)]
    pub req_sigs: u32,

    #[serde(rename = "type")]
    pub script_type: String,

    /// Older daemons list addresses; newer ones use `address`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Output of a verbose transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vout {
    /// Value in BTC, as the daemon reports it
    pub value: f64,

    pub n: u32,

    #[serde(rename = "scriptPubKey", alias = "scriptpubkey")]
    pub script_pubkey: PkScript,
}

impl Vout {
    /// Output value, `None` if the reported value is not a valid amount.
    pub fn amount(&self) -> Option<Amount> {
        Amount::from_btc(self.value).ok()
    }
}

/// Verbose result of `blockchain.transaction.get`.
///
/// This is the bitcoind `getrawtransaction` result passed through. The
/// daemon's `hash` field is the wtxid and is omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetTransactionResult {
    pub txid: String,
    pub version: u32,
    pub size: u32,
    pub vsize: u32,
    pub weight: u32,
    pub locktime: u32,
    pub hex: String,
    pub vin: Vec<Vin>,
    pub vout: Vec<Vout>,

    /// Absent while unconfirmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocktime: Option<i64>,
}

/// Result of `blockchain.block.headers`.
///
/// `hex` is `count` serialized 80-byte headers concatenated. The server
/// may return fewer headers than requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaders {
    pub count: u32,
    pub hex: String,
    pub max: u32,
}

impl BlockHeaders {
    /// Decode the concatenated headers.
    pub fn headers(&self) -> ElectrumResult<Vec<bitcoin::block::Header>> {
        let bytes = hex::decode(&self.hex)
            .map_err(|e| ElectrumError::Codec(format!("invalid header hex: {}", e)))?;
        if bytes.len() != self.count as usize * 80 {
            return Err(ElectrumError::Codec(format!(
                "expected {} headers, got {} bytes",
                self.count,
                bytes.len()
            )));
        }
        bytes
            .chunks_exact(80)
            .map(|chunk| {
                bitcoin::consensus::deserialize::<bitcoin::block::Header>(chunk)
                    .map_err(|e| ElectrumError::Codec(format!("invalid header: {}", e)))
            })
            .collect()
    }
}

/// Confirmed or mempool transaction touching a scripthash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Block height; 0 or -1 for mempool transactions
    pub height: i64,

    pub tx_hash: String,

    /// Satoshis, mempool transactions only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

/// Unspent output paying to a scripthash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    /// 0 if unconfirmed
    pub height: i64,
    pub tx_pos: u32,
    pub tx_hash: String,

    /// Satoshis
    pub value: u64,
}

impl UnspentOutput {
    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.value)
    }
}

impl ServerConn {
    /// Ping the server. The keepalive loop does this on its own; this is
    /// an on-demand connectivity check.
    pub async fn ping(&self, cancel: &CancellationToken) -> ElectrumResult<()> {
        self.call(cancel, "server.ping", Params::none()).await
    }

    /// Operator announcement. Untrusted text.
    pub async fn banner(&self, cancel: &CancellationToken) -> ElectrumResult<String> {
        self.request(cancel, "server.banner", Params::none()).await
    }

    /// Features the server claims. Check `genesis_hash` to make sure the
    /// server is on the intended network.
    pub async fn features(&self, cancel: &CancellationToken) -> ElectrumResult<ServerFeatures> {
        self.request(cancel, "server.features", Params::none())
            .await
    }

    /// Other servers this server knows about. See
    /// [`ssl_peer_addrs`](super::peers::ssl_peer_addrs) for picking
    /// usable ones.
    pub async fn peers(&self, cancel: &CancellationToken) -> ElectrumResult<Vec<PeerInfo>> {
        // Named "subscribe" but the server sends no notifications for it
        let raw: Value = self
            .request(cancel, "server.peers.subscribe", Params::none())
            .await?;
        Ok(parse_peers(raw))
    }

    /// Verbose transaction. Requires a server backed by a txindex daemon.
    pub async fn get_transaction(
        &self,
        cancel: &CancellationToken,
        txid: &str,
    ) -> ElectrumResult<GetTransactionResult> {
        self.request(
            cancel,
            "blockchain.transaction.get",
            Params::from(vec![json!(txid), json!(true)]),
        )
        .await
    }

    /// Raw transaction as hex.
    pub async fn get_raw_transaction(
        &self,
        cancel: &CancellationToken,
        txid: &str,
    ) -> ElectrumResult<String> {
        self.request(
            cancel,
            "blockchain.transaction.get",
            Params::from(vec![json!(txid), json!(false)]),
        )
        .await
    }

    /// Serialized block header at `height`, hex encoded.
    pub async fn block_header(
        &self,
        cancel: &CancellationToken,
        height: u32,
    ) -> ElectrumResult<String> {
        self.request(
            cancel,
            "blockchain.block.header",
            Params::from(vec![json!(height)]),
        )
        .await
    }

    /// Up to `count` consecutive headers starting at `start_height`.
    pub async fn block_headers(
        &self,
        cancel: &CancellationToken,
        start_height: u32,
        count: u32,
    ) -> ElectrumResult<BlockHeaders> {
        self.request(
            cancel,
            "blockchain.block.headers",
            Params::from(vec![json!(start_height), json!(count)]),
        )
        .await
    }

    /// Subscribe to chain tip changes and return the current tip.
    ///
    /// Later tips arrive on [`headers_notify`](Self::headers_notify). Not
    /// every block is guaranteed a notification when several arrive in
    /// quick succession.
    pub async fn subscribe_headers(
        &self,
        cancel: &CancellationToken,
    ) -> ElectrumResult<HeaderNotification> {
        self.request(cancel, HEADERS_SUBSCRIBE, Params::none()).await
    }

    /// Stop chain tip notifications.
    pub async fn unsubscribe_headers(&self, cancel: &CancellationToken) -> ElectrumResult<bool> {
        self.request(cancel, "blockchain.headers.unsubscribe", Params::none())
            .await
    }

    /// Broadcast a raw transaction, returning its txid.
    pub async fn broadcast(
        &self,
        cancel: &CancellationToken,
        raw_tx_hex: &str,
    ) -> ElectrumResult<String> {
        self.request(
            cancel,
            "blockchain.transaction.broadcast",
            Params::from(vec![json!(raw_tx_hex)]),
        )
        .await
    }

    /// Fee rate, per 1000 virtual bytes, for confirmation within
    /// `blocks` blocks.
    ///
    /// Fails with [`ElectrumError::CannotEstimateFee`] when the daemon
    /// lacks the data, which the server reports as -1.
    pub async fn estimate_fee(
        &self,
        cancel: &CancellationToken,
        blocks: u32,
    ) -> ElectrumResult<Amount> {
        let btc_per_kvb: f64 = self
            .request(
                cancel,
                "blockchain.estimatefee",
                Params::from(vec![json!(blocks)]),
            )
            .await?;
        fee_rate_from_btc(btc_per_kvb)
    }

    /// History of a scripthash, confirmed first, then mempool.
    pub async fn get_history(
        &self,
        cancel: &CancellationToken,
        scripthash: &Scripthash,
    ) -> ElectrumResult<Vec<HistoryEntry>> {
        self.request(
            cancel,
            "blockchain.scripthash.get_history",
            Params::from(vec![json!(scripthash)]),
        )
        .await
    }

    /// Unspent outputs of a scripthash.
    pub async fn list_unspent(
        &self,
        cancel: &CancellationToken,
        scripthash: &Scripthash,
    ) -> ElectrumResult<Vec<UnspentOutput>> {
        self.request(
            cancel,
            "blockchain.scripthash.listunspent",
            Params::from(vec![json!(scripthash)]),
        )
        .await
    }

    /// Subscribe to status changes of a scripthash and return its current
    /// status (`None` if it has no history).
    ///
    /// Later changes arrive on [`scripthash_notify`](Self::scripthash_notify).
    pub async fn subscribe_scripthash(
        &self,
        cancel: &CancellationToken,
        scripthash: &Scripthash,
    ) -> ElectrumResult<Option<String>> {
        let status: Option<String> = self
            .request(
                cancel,
                SCRIPTHASH_SUBSCRIBE,
                Params::from(vec![json!(scripthash)]),
            )
            .await?;
        Ok(status.filter(|s| !s.is_empty()))
    }

    /// Stop status notifications for a scripthash. Returns false if it was
    /// not subscribed.
    pub async fn unsubscribe_scripthash(
        &self,
        cancel: &CancellationToken,
        scripthash: &Scripthash,
    ) -> ElectrumResult<bool> {
        self.request(
            cancel,
            "blockchain.scripthash.unsubscribe",
            Params::from(vec![json!(scripthash)]),
        )
        .await
    }
}

fn fee_rate_from_btc(btc_per_kvb: f64) -> ElectrumResult<Amount> {
    if btc_per_kvb == -1.0 {
        return Err(ElectrumError::CannotEstimateFee);
    }
    Amount::from_btc(btc_per_kvb)
        .map_err(|e| ElectrumError::Codec(format!("invalid fee rate {}: {}", btc_per_kvb, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::electrumx::client::ConnectOpts;
    use crate::electrumx::connection::FakeServer;
    use std::sync::Arc;

    const SCRIPTHASH: &str = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";

    // Genesis block header
    const GENESIS_HEADER: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c";

    async fn connected() -> (Arc<ServerConn>, FakeServer, CancellationToken) {
        let (stream, mut server) = FakeServer::pair();
        let shutdown = CancellationToken::new();
        let (conn, ()) = tokio::join!(
            ServerConn::from_stream("fake", stream, ConnectOpts::default(), &shutdown),
            server.accept_version("1.4"),
        );
        (Arc::new(conn.unwrap()), server, shutdown)
    }

    /// Run `f` against the connection while the server answers one request
    /// with `result`, returning the request the server saw and the
    /// method's outcome.
    async fn exchange<T, F, Fut>(result: Value, f: F) -> (Value, ElectrumResult<T>)
    where
        F: FnOnce(Arc<ServerConn>, CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ElectrumResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (conn, mut server, _shutdown) = connected().await;
        let client = tokio::spawn(f(conn.clone(), CancellationToken::new()));

        let req = server.recv().await;
        server.reply(&req["id"], result).await;
        (req, client.await.unwrap())
    }

    #[tokio::test]
    async fn test_features() {
        let (req, result) = exchange(
            json!({
                "genesis_hash": "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
                "hosts": {"testnet.example.com": {"tcp_port": 51001, "ssl_port": null}},
                "protocol_max": "1.4.2",
                "protocol_min": "1.4",
                "pruning": null,
                "server_version": "ElectrumX 1.16.0",
                "hash_function": "sha256",
                "services": ["tcp://testnet.example.com:51001"]
            }),
            |conn, cancel| async move { conn.features(&cancel).await },
        )
        .await;

        assert_eq!(req["method"], "server.features");
        let features = result.unwrap();
        assert!(features.genesis_hash.starts_with("000000000933"));
        assert_eq!(
            features.hosts["testnet.example.com"]["tcp_port"],
            Some(51001)
        );
        assert_eq!(features.hosts["testnet.example.com"]["ssl_port"], None);
        assert_eq!(features.pruning, None);
    }

    #[tokio::test]
    async fn test_peers_parsed_leniently() {
        let (req, result) = exchange(
            json!([
                ["1.2.3.4", "a.example.com", ["v1.4", "s50002"]],
                ["broken"]
            ]),
            |conn, cancel| async move { conn.peers(&cancel).await },
        )
        .await;

        assert_eq!(req["method"], "server.peers.subscribe");
        let peers = result.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host, "a.example.com");
    }

    #[tokio::test]
    async fn test_get_transaction_verbose() {
        let (req, result) = exchange(
            json!({
                "txid": "aa",
                "hash": "bb",
                "version": 2,
                "size": 225,
                "vsize": 144,
                "weight": 573,
                "locktime": 0,
                "hex": "0200",
                "vin": [{
                    "txid": "cc",
                    "vout": 1,
                    "scriptSig": {"asm": "", "hex": ""},
                    "txinwitness": ["3044", "02ab"],
                    "sequence": 4294967295u32
                }],
                "vout": [{
                    "value": 0.0005,
                    "n": 0,
                    "scriptPubKey": {
                        "asm": "0 1234",
                        "hex": "00141234",
                        "type": "witness_v0_keyhash",
                        "address": "bc1qexample"
                    }
                }],
                "confirmations": 3
            }),
            |conn, cancel| async move { conn.get_transaction(&cancel, "aa").await },
        )
        .await;

        assert_eq!(req["method"], "blockchain.transaction.get");
        assert_eq!(req["params"], json!(["aa", true]));

        let tx = result.unwrap();
        assert_eq!(tx.vin[0].witness.len(), 2);
        assert!(tx.vin[0].script_sig.is_some());
        assert_eq!(tx.vout[0].amount(), Some(Amount::from_sat(50_000)));
        assert_eq!(tx.vout[0].script_pubkey.address.as_deref(), Some("bc1qexample"));
        assert_eq!(tx.confirmations, Some(3));
        assert_eq!(tx.blockhash, None);
    }

    #[tokio::test]
    async fn test_get_raw_transaction() {
        let (req, result) = exchange(json!("0200beef"), |conn, cancel| async move {
            conn.get_raw_transaction(&cancel, "aa").await
        })
        .await;

        assert_eq!(req["params"], json!(["aa", false]));
        assert_eq!(result.unwrap(), "0200beef");
    }

    #[tokio::test]
    async fn test_block_headers_decode() {
        let (req, result) = exchange(
            json!({"count": 1, "hex": GENESIS_HEADER, "max": 2016}),
            |conn, cancel| async move { conn.block_headers(&cancel, 0, 10).await },
        )
        .await;

        assert_eq!(req["method"], "blockchain.block.headers");
        assert_eq!(req["params"], json!([0, 10]));

        let batch = result.unwrap();
        assert_eq!(batch.count, 1);
        let headers = batch.headers().unwrap();
        assert_eq!(
            headers[0].block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_block_headers_count_mismatch() {
        let batch = BlockHeaders {
            count: 2,
            hex: GENESIS_HEADER.to_string(),
            max: 2016,
        };
        assert!(matches!(batch.headers(), Err(ElectrumError::Codec(_))));
    }

    #[tokio::test]
    async fn test_subscribe_headers_returns_tip() {
        let (req, result) = exchange(
            json!({"height": 840000, "hex": GENESIS_HEADER}),
            |conn, cancel| async move { conn.subscribe_headers(&cancel).await },
        )
        .await;

        assert_eq!(req["method"], "blockchain.headers.subscribe");
        assert_eq!(req["params"], json!([]));
        let tip = result.unwrap();
        assert_eq!(tip.height, 840000);
        assert!(tip.header().is_ok());
    }

    #[tokio::test]
    async fn test_unsubscribe_headers() {
        let (req, result) = exchange(json!(true), |conn, cancel| async move {
            conn.unsubscribe_headers(&cancel).await
        })
        .await;

        assert_eq!(req["method"], "blockchain.headers.unsubscribe");
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn test_estimate_fee() {
        let (req, result) = exchange(json!(0.00012), |conn, cancel| async move {
            conn.estimate_fee(&cancel, 6).await
        })
        .await;

        assert_eq!(req["method"], "blockchain.estimatefee");
        assert_eq!(req["params"], json!([6]));
        assert_eq!(result.unwrap(), Amount::from_sat(12_000));
    }

    #[tokio::test]
    async fn test_estimate_fee_unavailable() {
        let (_, result) = exchange(json!(-1), |conn, cancel| async move {
            conn.estimate_fee(&cancel, 1).await
        })
        .await;

        assert!(matches!(result, Err(ElectrumError::CannotEstimateFee)));
    }

    #[test]
    fn test_negative_fee_rate_is_codec_error() {
        assert!(matches!(
            fee_rate_from_btc(-0.5),
            Err(ElectrumError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn test_get_history() {
        let (req, result) = exchange(
            json!([
                {"height": 200004, "tx_hash": "aa"},
                {"height": 0, "tx_hash": "bb", "fee": 20000}
            ]),
            |conn, cancel| async move {
                let scripthash: Scripthash = SCRIPTHASH.parse().unwrap();
                conn.get_history(&cancel, &scripthash).await
            },
        )
        .await;

        assert_eq!(req["method"], "blockchain.scripthash.get_history");
        assert_eq!(req["params"], json!([SCRIPTHASH]));
        let history = result.unwrap();
        assert_eq!(history[0].fee, None);
        assert_eq!(history[1].fee, Some(20000));
    }

    #[tokio::test]
    async fn test_list_unspent() {
        let (req, result) = exchange(
            json!([{"height": 437146, "tx_pos": 0, "tx_hash": "aa", "value": 45318048}]),
            |conn, cancel| async move {
                let scripthash: Scripthash = SCRIPTHASH.parse().unwrap();
                conn.list_unspent(&cancel, &scripthash).await
            },
        )
        .await;

        assert_eq!(req["method"], "blockchain.scripthash.listunspent");
        let utxos = result.unwrap();
        assert_eq!(utxos[0].amount(), Amount::from_sat(45318048));
    }

    #[tokio::test]
    async fn test_subscribe_scripthash_statuses() {
        for (reply, expected) in [
            (json!("f00d"), Some("f00d".to_string())),
            (Value::Null, None),
            (json!(""), None),
        ] {
            let (req, result) = exchange(reply, |conn, cancel| async move {
                let scripthash: Scripthash = SCRIPTHASH.parse().unwrap();
                conn.subscribe_scripthash(&cancel, &scripthash).await
            })
            .await;

            assert_eq!(req["method"], "blockchain.scripthash.subscribe");
            assert_eq!(req["params"], json!([SCRIPTHASH]));
            assert_eq!(result.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_scripthash() {
        let (req, result) = exchange(json!(false), |conn, cancel| async move {
            let scripthash: Scripthash = SCRIPTHASH.parse().unwrap();
            conn.unsubscribe_scripthash(&cancel, &scripthash).await
        })
        .await;

        assert_eq!(req["method"], "blockchain.scripthash.unsubscribe");
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_rejected() {
        let (conn, mut server, _shutdown) = connected().await;
        let cancel = CancellationToken::new();

        let client = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.broadcast(&cancel, "00").await })
        };

        let req = server.recv().await;
        assert_eq!(req["method"], "blockchain.transaction.broadcast");
        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": {"code": 1, "message": "the transaction was rejected by network rules."}
            }))
            .await;

        match client.await.unwrap() {
            Err(ElectrumError::Rpc(e)) => assert_eq!(e.code, 1),
            other => panic!("Expected Rpc error, got {:?}", other),
        }
    }
}

//! ElectrumX message types and JSON-RPC framing.
//!
//! The wire format is one JSON object per line. Outgoing requests carry
//! `jsonrpc`, `id`, `method` and `params`. Incoming frames are either
//! responses (an `id` plus `result` or `error`) or notifications (a
//! `method` plus `params`, no id).
//!
//! ## Quirks handled here
//!
//! - `params` must always be an array or an object. ElectrumX rejects
//!   `null`, so "no arguments" is sent as `[]`.
//! - Not every server returns a structured error object. Some (e.g.
//!   blockstream.info) reply with a bare string such as
//!   `"verbose transactions are currently unsupported"`, so [`RpcError`]
//!   accepts both shapes.
//! - Scripthash status notifications are a two-element array of strings,
//!   not an object, and the status is `null` for an address with no
//!   history.

use std::fmt;

use bitcoin::block::Header;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{ElectrumError, ElectrumResult};
use super::scripthash::Scripthash;

/// JSON-RPC version tag sent with every request. ElectrumX answers with
/// 2.0 framing regardless of what the client claims.
pub const JSONRPC_VERSION: &str = "2.0";

/// Chain tip subscription method, also used for tip notifications.
pub const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";

/// Scripthash subscription method, also used for status notifications.
pub const SCRIPTHASH_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";

/// Request arguments.
///
/// ElectrumX methods take either positional arguments (a JSON array) or
/// named arguments (a JSON object). Anything else is a programming
/// error and is rejected here, before a frame is ever written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Params {
    /// Positional arguments, e.g. `["<txid>", true]`
    Positional(Vec<Value>),

    /// Named arguments, e.g. `{"tx_hash": "<txid>", "verbose": true}`
    Named(Map<String, Value>),
}

impl Params {
    /// No arguments. Encodes as `[]`, never `null`.
    pub fn none() -> Self {
        Params::Positional(Vec::new())
    }

    /// Named arguments from any type that serializes to a JSON object.
    pub fn named<T: Serialize>(args: &T) -> ElectrumResult<Self> {
        match serde_json::to_value(args)? {
            Value::Object(map) => Ok(Params::Named(map)),
            other => Err(ElectrumError::InvalidParams(format!(
                "named arguments must serialize to an object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::none()
    }
}

impl From<Vec<Value>> for Params {
    fn from(args: Vec<Value>) -> Self {
        Params::Positional(args)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(args: Map<String, Value>) -> Self {
        Params::Named(args)
    }
}

impl TryFrom<Value> for Params {
    type Error = ElectrumError;

    /// Arrays become positional, objects named, and `null` means no
    /// arguments. Bare scalars are rejected.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(args) => Ok(Params::Positional(args)),
            Value::Object(args) => Ok(Params::Named(args)),
            Value::Null => Ok(Params::none()),
            other => Err(ElectrumError::InvalidParams(format!(
                "arguments must be an array or object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Params,
}

/// Serialize a request into a newline-terminated frame.
pub fn encode_request(id: u64, method: &str, params: &Params) -> ElectrumResult<Vec<u8>> {
    let mut frame = serde_json::to_vec(&Request {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    })?;
    frame.push(b'\n');
    Ok(frame)
}

/// Error object returned by the server for a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    /// Error code, 0 when the server sent only a message
    pub code: i64,

    /// Human-readable message
    pub message: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {:?}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// The two error shapes seen in the wild. Tried in order: the structured
/// object first, then a bare string.
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorShape {
    Object {
        #[serde(default)]
        code: i64,
        #[serde(default)]
        message: String,
    },
    Text(String),
}

impl RpcError {
    /// Normalize an error payload of either shape.
    pub fn from_value(value: Value) -> ElectrumResult<Self> {
        match serde_json::from_value::<ErrorShape>(value) {
            Ok(ErrorShape::Object { code, message }) => Ok(Self { code, message }),
            Ok(ErrorShape::Text(message)) => Ok(Self { code: 0, message }),
            Err(_) => Err(ElectrumError::Codec(
                "cannot parse error object returned from server".to_string(),
            )),
        }
    }
}

/// Response to a request we sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// ID of the request this answers
    pub id: u64,

    /// Result payload (`null` when absent)
    pub result: Value,

    /// Error object, if the request failed
    pub error: Option<RpcError>,
}

impl Response {
    /// Convert into the caller's result type, surfacing a server error.
    pub fn into_result<T: DeserializeOwned>(self) -> ElectrumResult<T> {
        if let Some(error) = self.error {
            return Err(ElectrumError::Rpc(error));
        }
        Ok(serde_json::from_value(self.result)?)
    }
}

/// One entry of a chain tip notification (or of the reply to
/// `blockchain.headers.subscribe`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNotification {
    /// Block height
    pub height: u32,

    /// Serialized 80-byte header, hex encoded
    pub hex: String,
}

impl HeaderNotification {
    /// Decode the serialized header.
    pub fn header(&self) -> ElectrumResult<Header> {
        let bytes = hex::decode(&self.hex)
            .map_err(|e| ElectrumError::Codec(format!("header hex: {}", e)))?;
        bitcoin::consensus::deserialize(&bytes)
            .map_err(|e| ElectrumError::Codec(format!("header decode: {}", e)))
    }
}

/// Status change of a subscribed scripthash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScripthashStatus {
    /// Which subscription changed
    pub scripthash: Scripthash,

    /// Digest of the scripthash's history, `None` if it has no history
    pub status: Option<String>,
}

impl ScripthashStatus {
    /// Parse the raw `[scripthash, status]` notification params.
    fn from_params(params: Value) -> ElectrumResult<Self> {
        let (scripthash, status): (String, Option<String>) = serde_json::from_value(params)
            .map_err(|e| ElectrumError::Codec(format!("scripthash notification: {}", e)))?;
        let scripthash = scripthash.parse().map_err(|e: ElectrumError| {
            ElectrumError::Codec(format!("scripthash notification: {}", e))
        })?;
        Ok(Self {
            scripthash,
            status: status.filter(|s| !s.is_empty()),
        })
    }
}

/// Unsolicited message from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// New chain tip(s), in the order the server sent them
    Headers(Vec<HeaderNotification>),

    /// A subscribed scripthash's history changed
    ///
    /// ElectrumX always sends the 64-character hex scripthash; any other
    /// identifier is a malformed frame and is skipped, never reaching
    /// the subscription registry.
    ScripthashStatus(ScripthashStatus),

    /// Notification for a method we do not handle
    Unknown {
        /// Method name as sent by the server
        method: String,
    },
}

impl Notification {
    fn parse(method: String, params: Value) -> ElectrumResult<Self> {
        match method.as_str() {
            HEADERS_SUBSCRIBE => {
                let headers = serde_json::from_value(params)
                    .map_err(|e| ElectrumError::Codec(format!("headers notification: {}", e)))?;
                Ok(Notification::Headers(headers))
            }
            SCRIPTHASH_SUBSCRIBE => Ok(Notification::ScripthashStatus(
                ScripthashStatus::from_params(params)?,
            )),
            _ => Ok(Notification::Unknown { method }),
        }
    }
}

/// A decoded incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Answer to one of our requests
    Response(Response),

    /// Server push
    Notification(Notification),
}

/// Union of every field an incoming frame may carry. Classification
/// happens after parsing since responses and notifications share no
/// discriminating tag.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Decode one frame (without its trailing newline).
pub fn decode(frame: &[u8]) -> ElectrumResult<ServerMessage> {
    let raw: RawFrame = serde_json::from_slice(frame)
        .map_err(|e| ElectrumError::Codec(format!("invalid frame: {}", e)))?;

    if let Some(method) = raw.method.filter(|m| !m.is_empty()) {
        return Ok(ServerMessage::Notification(Notification::parse(
            method, raw.params,
        )?));
    }

    let id = raw
        .id
        .ok_or_else(|| ElectrumError::Codec("frame has neither method nor id".to_string()))?;
    let error = raw.error.map(RpcError::from_value).transpose()?;

    Ok(ServerMessage::Response(Response {
        id,
        result: raw.result.unwrap_or(Value::Null),
        error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode_to_json(id: u64, method: &str, params: &Params) -> Value {
        let frame = encode_request(id, method, params).unwrap();
        assert_eq!(frame.last(), Some(&b'\n'));
        serde_json::from_slice(&frame[..frame.len() - 1]).unwrap()
    }

    #[test]
    fn test_encode_positional_request() {
        let params = Params::from(vec![json!("abcd"), json!(true)]);
        let json = encode_to_json(7, "blockchain.transaction.get", &params);

        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "blockchain.transaction.get");
        assert_eq!(json["params"], json!(["abcd", true]));
    }

    #[test]
    fn test_encode_named_request() {
        #[derive(Serialize)]
        struct Args {
            tx_hash: String,
            verbose: bool,
        }

        let params = Params::named(&Args {
            tx_hash: "abcd".to_string(),
            verbose: false,
        })
        .unwrap();
        let json = encode_to_json(1, "blockchain.transaction.get", &params);

        assert_eq!(json["params"], json!({"tx_hash": "abcd", "verbose": false}));
    }

    #[test]
    fn test_encode_no_params_as_empty_list() {
        let json = encode_to_json(2, "server.ping", &Params::none());
        assert_eq!(json["params"], json!([]));

        let from_null = Params::try_from(Value::Null).unwrap();
        let json = encode_to_json(3, "server.ping", &from_null);
        assert_eq!(json["params"], json!([]));
    }

    #[test]
    fn test_reject_scalar_params() {
        assert!(matches!(
            Params::try_from(json!(42)),
            Err(ElectrumError::InvalidParams(_))
        ));
        assert!(matches!(
            Params::try_from(json!("abcd")),
            Err(ElectrumError::InvalidParams(_))
        ));
        assert!(matches!(
            Params::named(&"not an object"),
            Err(ElectrumError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_params_from_json_shapes() {
        assert_eq!(
            Params::try_from(json!([1, 2])).unwrap(),
            Params::Positional(vec![json!(1), json!(2)])
        );
        assert!(matches!(
            Params::try_from(json!({"a": 1})).unwrap(),
            Params::Named(_)
        ));
    }

    #[test]
    fn test_decode_response() {
        let msg = decode(br#"{"jsonrpc":"2.0","id":5,"result":"banner text"}"#).unwrap();
        match msg {
            ServerMessage::Response(resp) => {
                assert_eq!(resp.id, 5);
                assert_eq!(resp.result, json!("banner text"));
                assert_eq!(resp.error, None);
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_null_result() {
        // server.ping answers with a null result
        let msg = decode(br#"{"jsonrpc":"2.0","id":9,"result":null}"#).unwrap();
        match msg {
            ServerMessage::Response(resp) => {
                assert_eq!(resp.result, Value::Null);
                assert!(resp.into_result::<serde::de::IgnoredAny>().is_ok());
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_structured_error() {
        let msg = decode(
            br#"{"jsonrpc":"2.0","id":1,"error":{"code":1,"message":"unsupported protocol version: 1.4"}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Response(resp) => {
                let err = resp.error.clone().unwrap();
                assert_eq!(err.code, 1);
                assert_eq!(err.message, "unsupported protocol version: 1.4");
                assert!(matches!(
                    resp.into_result::<Value>(),
                    Err(ElectrumError::Rpc(e)) if e.code == 1
                ));
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_string_error() {
        let msg = decode(
            br#"{"id":3,"error":"verbose transactions are currently unsupported"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Response(resp) => {
                let err = resp.error.unwrap();
                assert_eq!(err.code, 0);
                assert_eq!(err.message, "verbose transactions are currently unsupported");
            }
            other => panic!("Expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unparseable_error_is_codec_error() {
        let result = decode(br#"{"id":3,"error":[1,2,3]}"#);
        assert!(matches!(result, Err(ElectrumError::Codec(_))));
    }

    #[test]
    fn test_decode_headers_notification() {
        let msg = decode(
            br#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[{"height":100,"hex":"aa"},{"height":101,"hex":"bb"}]}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Notification(Notification::Headers(headers)) => {
                assert_eq!(headers.len(), 2);
                assert_eq!(headers[0].height, 100);
                assert_eq!(headers[1].hex, "bb");
            }
            other => panic!("Expected headers notification, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_scripthash_notification() {
        let scripthash = "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161";
        let frame = format!(
            r#"{{"jsonrpc":"2.0","method":"blockchain.scripthash.subscribe","params":["{}","deadbeef"]}}"#,
            scripthash
        );
        match decode(frame.as_bytes()).unwrap() {
            ServerMessage::Notification(Notification::ScripthashStatus(status)) => {
                assert_eq!(status.scripthash.to_string(), scripthash);
                assert_eq!(status.status.as_deref(), Some("deadbeef"));
            }
            other => panic!("Expected scripthash notification, got {:?}", other),
        }

        // Null status means the scripthash has no history
        let frame = format!(
            r#"{{"method":"blockchain.scripthash.subscribe","params":["{}",null]}}"#,
            scripthash
        );
        match decode(frame.as_bytes()).unwrap() {
            ServerMessage::Notification(Notification::ScripthashStatus(status)) => {
                assert_eq!(status.status, None);
            }
            other => panic!("Expected scripthash notification, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_scripthash_notification_wrong_shape() {
        // Object instead of a two-element array
        let result = decode(
            br#"{"method":"blockchain.scripthash.subscribe","params":{"scripthash":"aa"}}"#,
        );
        assert!(matches!(result, Err(ElectrumError::Codec(_))));

        // Three elements
        let result = decode(br#"{"method":"blockchain.scripthash.subscribe","params":["a","b","c"]}"#);
        assert!(matches!(result, Err(ElectrumError::Codec(_))));

        // Identifier that is not a scripthash
        let result = decode(br#"{"method":"blockchain.scripthash.subscribe","params":["a","b"]}"#);
        assert!(matches!(result, Err(ElectrumError::Codec(_))));
    }

    #[test]
    fn test_decode_unknown_notification() {
        let msg = decode(br#"{"method":"blockchain.relayfee.changed","params":[]}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Notification(Notification::Unknown {
                method: "blockchain.relayfee.changed".to_string()
            })
        );
    }

    #[test]
    fn test_decode_malformed_frames() {
        assert!(matches!(decode(b"not json"), Err(ElectrumError::Codec(_))));
        assert!(matches!(decode(b"{}"), Err(ElectrumError::Codec(_))));
        // Response with null id, as some servers send for parse errors
        assert!(matches!(
            decode(br#"{"id":null,"error":{"code":-32700,"message":"parse error"}}"#),
            Err(ElectrumError::Codec(_))
        ));
    }

    #[test]
    fn test_header_notification_decodes_header() {
        // Bitcoin genesis block header
        let genesis = HeaderNotification {
            height: 0,
            hex: "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c".to_string(),
        };
        let header = genesis.header().unwrap();
        assert_eq!(
            header.block_hash().to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );

        let bad = HeaderNotification {
            height: 1,
            hex: "abcd".to_string(),
        };
        assert!(bad.header().is_err());
    }
}

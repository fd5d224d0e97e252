//! Scripthash subscription identifiers.
//!
//! ElectrumX does not index addresses. Every address-level method
//! (`blockchain.scripthash.*`) takes a *scripthash* instead: the SHA-256
//! of the address's output script, with the digest bytes reversed and
//! hex-encoded. The reversal follows the display convention Bitcoin uses
//! for txids and block hashes. Getting any step wrong does not produce
//! an error; the server simply never notifies about the address, so the
//! derivation lives in exactly one place.

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash as _;
use bitcoin::hashes::sha256;
use bitcoin::{Address, Script};
use serde::{Deserialize, Serialize};

use super::error::ElectrumError;

/// Protocol identifier of a watched output script.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scripthash([u8; 32]);

impl Scripthash {
    /// Derive the scripthash of an output script.
    pub fn for_script(script: &Script) -> Self {
        let mut bytes = sha256::Hash::hash(script.as_bytes()).to_byte_array();
        bytes.reverse();
        Self(bytes)
    }

    /// Derive the scripthash of an address's standard output script.
    pub fn for_address(address: &Address) -> Self {
        Self::for_script(&address.script_pubkey())
    }

    /// Bytes in display (reversed) order.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Scripthash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Scripthash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scripthash({})", self)
    }
}

impl FromStr for Scripthash {
    type Err = ElectrumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| ElectrumError::InvalidScripthash(e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            ElectrumError::InvalidScripthash(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Scripthash {
    type Error = ElectrumError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Scripthash> for String {
    fn from(scripthash: Scripthash) -> Self {
        scripthash.to_string()
    }
}

//! Address to scripthash mapping for subscribed addresses.

use std::collections::HashMap;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network};

use crate::electrumx::{ElectrumResult, Scripthash};

/// Addresses the wallet has subscribed to, with their scripthashes.
///
/// Outgoing requests need the scripthash of an address; incoming status
/// notifications carry only a scripthash and must be routed back to the
/// address. While an entry exists the mapping is a bijection. Pure
/// bookkeeping: nothing here talks to a server.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    network: Network,
    entries: HashMap<Address, Scripthash>,
}

impl SubscriptionRegistry {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            entries: HashMap::new(),
        }
    }

    /// Network the registry's addresses belong to.
    pub fn network(&self) -> Network {
        self.network
    }

    /// Parse an address string and check it belongs to this network.
    pub fn parse_address(&self, address: &str) -> ElectrumResult<Address> {
        let address = address
            .parse::<Address<NetworkUnchecked>>()?
            .require_network(self.network)?;
        Ok(address)
    }

    /// Record a subscription for `address`.
    ///
    /// Returns the new scripthash, or `None` if the address was already
    /// subscribed. Any other address mapping to the same scripthash is
    /// replaced.
    pub fn subscribe(&mut self, address: Address) -> Option<Scripthash> {
        if self.entries.contains_key(&address) {
            return None;
        }
        let scripthash = Scripthash::for_address(&address);
        self.entries.retain(|_, existing| *existing != scripthash);
        self.entries.insert(address, scripthash);
        Some(scripthash)
    }

    /// Remove the subscription for `address`, returning its scripthash if
    /// it was subscribed.
    pub fn unsubscribe(&mut self, address: &Address) -> Option<Scripthash> {
        self.entries.remove(address)
    }

    /// Address a notification's scripthash belongs to.
    ///
    /// `None` means the address is no longer tracked; the notification
    /// raced an unsubscribe and can be ignored.
    pub fn resolve(&self, scripthash: &Scripthash) -> Option<&Address> {
        // Wallets track at most a few hundred addresses
        self.entries
            .iter()
            .find(|(_, candidate)| *candidate == scripthash)
            .map(|(address, _)| address)
    }

    pub fn scripthash_for(&self, address: &Address) -> Option<Scripthash> {
        self.entries.get(address).copied()
    }

    pub fn is_subscribed(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribed addresses, in no particular order.
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.entries.keys()
    }
}

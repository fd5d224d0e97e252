//! Keep a set of watched addresses in sync with a server.
//!
//! The [`AddressSynchronizer`] pairs a [`ServerConn`] with a
//! [`SubscriptionRegistry`]: it subscribes addresses on the server by
//! scripthash and turns the server's scripthash status notifications
//! back into per-address events.

use std::sync::Arc;

use bitcoin::{Address, Network};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::registry::SubscriptionRegistry;
use crate::electrumx::{
    ElectrumError, ElectrumResult, HistoryEntry, Scripthash, ServerConn, UnspentOutput,
};
use crate::tracing::prelude::*;

/// Events emitted by [`AddressSynchronizer::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEvent {
    /// The history of a watched address changed. `status` is the
    /// server's hash of the new history, `None` if it is now empty.
    StatusChanged {
        address: Address,
        status: Option<String>,
    },

    /// The connection terminated; no further events follow.
    Disconnected,
}

pub struct AddressSynchronizer {
    conn: Arc<ServerConn>,
    registry: Mutex<SubscriptionRegistry>,

    /// Held across each watch/unwatch so a registry change and its
    /// server request are never interleaved with another's
    changes: AsyncMutex<()>,
}

impl AddressSynchronizer {
    pub fn new(conn: Arc<ServerConn>, registry: SubscriptionRegistry) -> Self {
        Self {
            conn,
            registry: Mutex::new(registry),
            changes: AsyncMutex::new(()),
        }
    }

    pub fn conn(&self) -> &Arc<ServerConn> {
        &self.conn
    }

    pub fn network(&self) -> Network {
        self.registry.lock().network()
    }

    /// Parse an address for this synchronizer's network.
    pub fn parse_address(&self, address: &str) -> ElectrumResult<Address> {
        self.registry.lock().parse_address(address)
    }

    /// Start watching `address` and return its current status.
    ///
    /// The address is registered before the subscription is sent so that
    /// a notification racing the response can still be resolved. If the
    /// subscription fails the registration is rolled back. Watching an
    /// address twice re-queries its status. Concurrent watch and unwatch
    /// calls run one at a time.
    pub async fn watch(
        &self,
        cancel: &CancellationToken,
        address: Address,
    ) -> ElectrumResult<Option<String>> {
        let _change = tokio::select! {
            _ = cancel.cancelled() => return Err(ElectrumError::Canceled),
            change = self.changes.lock() => change,
        };

        let scripthash = Scripthash::for_address(&address);
        let added = self.registry.lock().subscribe(address.clone()).is_some();

        match self.conn.subscribe_scripthash(cancel, &scripthash).await {
            Ok(status) => {
                debug!(address = %address, scripthash = %scripthash, "Watching address");
                Ok(status)
            }
            Err(e) => {
                if added {
                    self.registry.lock().unsubscribe(&address);
                }
                Err(e)
            }
        }
    }

    /// Stop watching `address`.
    ///
    /// Returns false without contacting the server if the address was not
    /// watched.
    pub async fn unwatch(
        &self,
        cancel: &CancellationToken,
        address: &Address,
    ) -> ElectrumResult<bool> {
        let _change = tokio::select! {
            _ = cancel.cancelled() => return Err(ElectrumError::Canceled),
            change = self.changes.lock() => change,
        };

        let Some(scripthash) = self.registry.lock().unsubscribe(address) else {
            return Ok(false);
        };

        let was_subscribed = self.conn.unsubscribe_scripthash(cancel, &scripthash).await?;
        if !was_subscribed {
            debug!(address = %address, "Server had no subscription for address");
        }
        Ok(true)
    }

    pub fn is_watched(&self, address: &Address) -> bool {
        self.registry.lock().is_subscribed(address)
    }

    /// Currently watched addresses.
    pub fn watched(&self) -> Vec<Address> {
        self.registry.lock().addresses().cloned().collect()
    }

    /// History of any address, watched or not.
    pub async fn address_history(
        &self,
        cancel: &CancellationToken,
        address: &Address,
    ) -> ElectrumResult<Vec<HistoryEntry>> {
        let scripthash = Scripthash::for_address(address);
        self.conn.get_history(cancel, &scripthash).await
    }

    /// Unspent outputs of any address, watched or not.
    pub async fn address_unspent(
        &self,
        cancel: &CancellationToken,
        address: &Address,
    ) -> ElectrumResult<Vec<UnspentOutput>> {
        let scripthash = Scripthash::for_address(address);
        self.conn.list_unspent(cancel, &scripthash).await
    }

    /// Forward status notifications as address events until the
    /// connection ends or `events` is closed.
    ///
    /// Notifications for addresses no longer watched are dropped.
    pub async fn run(&self, events: mpsc::Sender<AddressEvent>) {
        let feed = self.conn.scripthash_notify();

        while let Some(change) = feed.recv().await {
            let address = self.registry.lock().resolve(&change.scripthash).cloned();
            let Some(address) = address else {
                debug!(scripthash = %change.scripthash, "Status change for unwatched scripthash");
                continue;
            };

            debug!(address = %address, status = ?change.status, "Address status changed");
            let event = AddressEvent::StatusChanged {
                address,
                status: change.status,
            };
            if events.send(event).await.is_err() {
                debug!("Event receiver closed, stopping");
                return;
            }
        }

        info!(server = %self.conn.addr(), "Connection closed, address sync stopped");
        let _ = events.send(AddressEvent::Disconnected).await;
    }
}

//! Address subscriptions.
//!
//! ElectrumX knows scripthashes, wallets know addresses. The
//! [`SubscriptionRegistry`] keeps the two-way mapping for the addresses
//! being watched, and the [`AddressSynchronizer`] drives subscriptions on
//! a live connection and reports status changes per address.

mod registry;
mod synchronizer;

pub use registry::SubscriptionRegistry;
pub use synchronizer::{AddressEvent, AddressSynchronizer};

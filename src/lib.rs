//! Fee claim monitor.
//!
//! Watches Solana accounts for fee claims and alerts every subscriber of an
//! account once per claim. Modules are shared by the daemon and the
//! operator binaries in `src/bin`.

pub mod config;
pub mod cursor;
pub mod detect;
pub mod kv;
pub mod ledger;
pub mod monitor;
pub mod notify;
pub mod registry;
pub mod resolver;
pub mod server;

#[cfg(test)]
mod testing;

//! SNI-dispatched, TLS-terminating reverse proxy with self-managed
//! certificates and a live-reconfigurable routing table.
//!
//! The three coupled concerns (SPEC_FULL.md §1) are split into modules
//! leaves-first: [`blob_store`] persists the routing table, [`codec`]
//! serializes it and the control protocol, [`control`] exposes the
//! authenticated reconfiguration channel, [`proxy`] is the public
//! listener pair, and [`cert`] owns the certificate lifecycle.

pub mod blob_store;
pub mod cert;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod proxy;
pub mod state_dir;
pub mod tracing_init;

pub use error::{ProxyError, Result};

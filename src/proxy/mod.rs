//! The two public listeners: port-80 redirect and the TLS-terminating,
//! SNI-dispatched proxy port (SPEC_FULL.md §4.4).

pub mod pump;
pub mod redirect;
pub mod tls;

pub use pump::bidirectional_pump;
pub use redirect::serve_redirect;
pub use tls::{serve_tls, SniProxyConfig};

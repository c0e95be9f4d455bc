//! Network subsystem for UDP audio transport

pub mod sink;
pub mod udp;

pub use sink::{NetworkSink, NetworkStats};
pub use udp::{create_socket, NetworkTarget};

//! UDP socket setup

use serde::Deserialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::constants::{DEFAULT_PEER_ADDRESS, DEFAULT_PEER_SERVICE};
use crate::error::NetworkError;

/// Addressing for the network stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkTarget {
    /// Local address to send from, any interface if unset
    pub bind_address: Option<String>,
    /// Peer host or multicast group
    pub peer_address: Option<String>,
    /// Peer port
    pub peer_service: Option<String>,
}

impl NetworkTarget {
    pub fn peer_address(&self) -> &str {
        self.peer_address.as_deref().unwrap_or(DEFAULT_PEER_ADDRESS)
    }

    pub fn peer_service(&self) -> &str {
        self.peer_service.as_deref().unwrap_or(DEFAULT_PEER_SERVICE)
    }
}

/// Resolve `host` and `service` (a port number) to the first socket address
pub fn resolve(host: &str, service: &str) -> Result<SocketAddr, NetworkError> {
    let describe = || format!("{}:{}", host, service);
    let port: u16 = service
        .parse()
        .map_err(|_| NetworkError::ResolveFailed(describe()))?;

    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::ResolveFailed(format!("{} ({})", describe(), e)))?
        .next()
        .ok_or_else(|| NetworkError::ResolveFailed(describe()))
}

/// Create a datagram socket for sending to `target`.
///
/// Returns the socket and the resolved peer address.
pub fn create_socket(target: &NetworkTarget) -> Result<(Socket, SockAddr), NetworkError> {
    let peer = resolve(target.peer_address(), target.peer_service())?;

    let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;

    if let Some(bind_address) = target.bind_address.as_deref() {
        let local = resolve(bind_address, "0")?;
        socket
            .bind(&local.into())
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", local, e)))?;

        if let (IpAddr::V4(group), IpAddr::V4(interface)) = (peer.ip(), local.ip()) {
            if group.is_multicast() {
                socket
                    .set_multicast_if_v4(&interface)
                    .map_err(|e| NetworkError::BindFailed(format!("{}: {}", interface, e)))?;
            }
        }
    }

    tracing::debug!("UDP socket ready, peer {}", peer);

    Ok((socket, peer.into()))
}

//! # Telemetry Server
//!
//! The simulator bridge sends one telemetry frame per request and waits for the reply frame
//! carrying the command. Several bridges may be connected at once, so the server is a ROUTER
//! socket and every request carries the identity of the peer that sent it.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::warn;
use std::fmt;

use comms_if::net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A duplex link carrying telemetry frames in and command frames out.
///
/// Every frame received must be answered by exactly one frame sent to the same peer before the
/// next receive.
pub trait TelemLink {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Receive the next frame and the peer which sent it, or `None` if nothing arrived within the
    /// link's timeout.
    fn recv_frame(&mut self) -> Result<Option<(PeerId, String)>, Self::Error>;

    /// Send the reply to the last frame received from `peer`.
    fn send_frame(&mut self, peer: &PeerId, frame: &str) -> Result<(), Self::Error>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Identifies one connected peer.
///
/// Holds the routing envelope of the peer's requests: its connection identity followed by the
/// empty delimiter frame a REQ peer adds. A reconnecting peer gets a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId {
    envelope: Vec<Vec<u8>>,
}

/// Telemetry server
pub struct TelemServer {
    socket: MonitoredSocket,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TelemServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not receive a frame: {0}")]
    RecvError(zmq::Error),

    #[error("Could not send a frame: {0}")]
    SendError(zmq::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PeerId {
    /// Peer id of a REQ peer with the given connection identity.
    pub fn new<I: Into<Vec<u8>>>(identity: I) -> Self {
        Self {
            envelope: vec![identity.into(), Vec::new()],
        }
    }

    /// Build from the routing envelope of a request, everything before the payload frame.
    fn from_envelope(envelope: Vec<Vec<u8>>) -> Self {
        Self { envelope }
    }

    /// The connection identity of the peer.
    pub fn identity(&self) -> &[u8] {
        self.envelope.first().map(|f| f.as_slice()).unwrap_or(&[])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.identity() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl TelemServer {
    /// Create a new instance of the telemetry server.
    ///
    /// This function will not block until a client connects.
    pub fn new(ctx: &zmq::Context, params: &NetParams) -> Result<Self, TelemServerError> {
        let socket_options = SocketOptions {
            bind: true,
            block_on_first_connect: false,
            heartbeat_ivl: 500,
            heartbeat_timeout: 1000,
            linger: 1,
            recv_timeout: params.recv_timeout_ms,
            send_timeout: params.send_timeout_ms,
        };

        let socket = MonitoredSocket::new(
            ctx,
            zmq::ROUTER,
            socket_options,
            &params.telem_endpoint
        ).map_err(TelemServerError::SocketError)?;

        Ok(Self { socket })
    }

    /// Return if a client is connected.
    pub fn connected(&self) -> bool {
        self.socket.connected()
    }

    /// Number of clients connected.
    pub fn num_peers(&self) -> usize {
        self.socket.num_peers()
    }
}

impl TelemLink for TelemServer {
    type Error = TelemServerError;

    fn recv_frame(&mut self) -> Result<Option<(PeerId, String)>, Self::Error> {
        let mut parts = match self.socket.recv_multipart(0) {
            Ok(p) => p,
            Err(zmq::Error::EAGAIN) => return Ok(None),
            Err(e) => return Err(TelemServerError::RecvError(e)),
        };

        // ROUTER always prefixes the identity, so anything shorter can't be answered
        if parts.len() < 2 {
            warn!("Dropping request without a routing envelope");
            return Ok(None);
        }

        let payload = parts.pop().unwrap_or_default();
        let peer = PeerId::from_envelope(parts);

        // Still has to be answered, the parser rejects it
        let frame = String::from_utf8_lossy(&payload).into_owned();

        Ok(Some((peer, frame)))
    }

    fn send_frame(&mut self, peer: &PeerId, frame: &str) -> Result<(), Self::Error> {
        let parts: Vec<&[u8]> = peer.envelope
            .iter()
            .map(|f| f.as_slice())
            .chain(std::iter::once(frame.as_bytes()))
            .collect();

        self.socket.send_multipart(parts, 0).map_err(TelemServerError::SendError)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_id() {
        let a = PeerId::new(vec![0x00, 0x6b, 0x8b]);
        let b = PeerId::new(vec![0x00, 0x6b, 0x8c]);

        assert_eq!(a.identity(), &[0x00, 0x6b, 0x8b]);
        assert_eq!(a.to_string(), "006b8b");
        assert_eq!(a, PeerId::from_envelope(vec![vec![0x00, 0x6b, 0x8b], vec![]]));

        let ids: HashSet<PeerId> = vec![a.clone(), b, a].into_iter().collect();
        assert_eq!(ids.len(), 2);
    }
}

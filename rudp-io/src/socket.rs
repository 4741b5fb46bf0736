//! UDP socket wrapper
//!
//! One socket per connection. Clones made with [`RudpSocket::try_clone`]
//! share the peer address, so a receiver that learns its peer from the first
//! inbound datagram can ack through any clone.

use parking_lot::RwLock;
use rudp_protocol::{DatagramSink, MAX_DATAGRAM};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Socket errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("No peer address known yet")]
    NoPeer,

    #[error("Datagram too large: {0} bytes")]
    Oversized(usize),
}

impl SocketError {
    /// Whether this is a read timeout or would-block rather than a real failure
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SocketError::Io(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
        )
    }
}

/// UDP socket carrying one reliable-UDP connection
pub struct RudpSocket {
    inner: Socket,
    peer: Arc<RwLock<Option<SocketAddr>>>,
}

impl RudpSocket {
    /// Create a blocking socket bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        tracing::debug!(%addr, "socket bound");
        Ok(RudpSocket {
            inner: socket,
            peer: Arc::new(RwLock::new(None)),
        })
    }

    /// Bind to `local` and send to `peer`
    pub fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self, SocketError> {
        let socket = Self::bind(local)?;
        socket.set_peer(peer);
        Ok(socket)
    }

    /// Set (or replace) the peer address
    pub fn set_peer(&self, peer: SocketAddr) {
        *self.peer.write() = Some(peer);
    }

    /// Current peer address
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read()
    }

    /// Bound reads; `None` blocks forever
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.inner.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set the send buffer size
    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_send_buffer_size(size)?;
        Ok(())
    }

    /// Set the receive buffer size
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Send one datagram to `target`
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        if buf.len() > MAX_DATAGRAM {
            return Err(SocketError::Oversized(buf.len()));
        }
        Ok(self.inner.send_to(buf, &target.into())?)
    }

    /// Send one datagram to the peer
    pub fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let peer = self.peer().ok_or(SocketError::NoPeer)?;
        self.send_to(buf, peer)
    }

    /// Receive one datagram
    ///
    /// The first datagram received while no peer is set makes its sender the
    /// peer.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        // SAFETY: `recv_from` only writes initialized bytes into the buffer,
        // and `u8` and `MaybeUninit<u8>` share a layout.
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };

        let (n, addr) = self.inner.recv_from(uninit)?;
        let addr = addr.as_socket().ok_or(SocketError::InvalidAddress)?;

        if self.peer().is_none() {
            let mut peer = self.peer.write();
            if peer.is_none() {
                tracing::info!(%addr, "learned peer address");
                *peer = Some(addr);
            }
        }
        Ok((n, addr))
    }

    /// Clone the socket handle, sharing the peer address
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(RudpSocket {
            inner: self.inner.try_clone()?,
            peer: Arc::clone(&self.peer),
        })
    }

    /// Get a reference to the underlying socket
    pub fn as_socket(&self) -> &Socket {
        &self.inner
    }
}

impl DatagramSink for RudpSocket {
    fn send_datagram(&self, datagram: &[u8]) -> bool {
        match self.send(datagram) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, len = datagram.len(), "raw send failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_socket_creation() {
        let socket = RudpSocket::bind(local()).unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
        assert_eq!(socket.peer(), None);
    }

    #[test]
    fn test_send_without_peer() {
        let socket = RudpSocket::bind(local()).unwrap();
        assert!(matches!(socket.send(b"x"), Err(SocketError::NoPeer)));
        assert!(!socket.send_datagram(b"x"));
    }

    #[test]
    fn test_rejects_oversized() {
        let a = RudpSocket::bind(local()).unwrap();
        let target = a.local_addr().unwrap();
        let big = vec![0u8; MAX_DATAGRAM + 1];
        assert!(matches!(
            a.send_to(&big, target),
            Err(SocketError::Oversized(n)) if n == MAX_DATAGRAM + 1
        ));
    }

    #[test]
    fn test_learns_peer_and_replies() {
        let receiver = RudpSocket::bind(local()).unwrap();
        let sender = RudpSocket::connect(local(), receiver.local_addr().unwrap()).unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        sender
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        assert!(sender.send_datagram(b"ping"));

        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(receiver.peer(), Some(from));

        // clones share the learned peer
        let clone = receiver.try_clone().unwrap();
        assert!(clone.send_datagram(b"pong"));
        let (n, _) = sender.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn test_read_timeout() {
        let socket = RudpSocket::bind(local()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(err.is_timeout());
    }
}

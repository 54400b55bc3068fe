//! Control-wire socket binding.
//!
//! Grounded on `receiver.rs`'s `socket2`-based UDP setup (the original
//! multicast shred socket), stripped to the non-blocking bind/recv shape a
//! cmdmon-style control socket actually needs: no multicast join, no
//! kernel-timestamp/batch-receive hot path, since the control wire carries
//! low-rate administrative traffic rather than a shred firehose.

use socket2::{Domain, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// A bound, non-blocking UDP socket for the control wire. Its raw fd is
/// registered with the scheduler's readiness table; `recv_from` is called
/// once the fd is reported readable.
pub struct ControlSocket {
    socket: Socket,
}

impl ControlSocket {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        Ok(Self { socket })
    }

    /// Reads one datagram without blocking. `Ok(None)` means the readiness
    /// notification was spurious (nothing left to read).
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(unsafe { as_uninit_mut(buf) }) {
            Ok((n, addr)) => Ok(Some((n, addr.as_socket().expect("bound to an inet address")))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, &addr.into())
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

/// `socket2::Socket::recv_from` wants `&mut [MaybeUninit<u8>]`; a plain
/// `&mut [u8]` is always a valid initialization of that, so this is a
/// zero-cost reinterpretation, not a new allocation.
unsafe fn as_uninit_mut(buf: &mut [u8]) -> &mut [std::mem::MaybeUninit<u8>] {
    std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast(), buf.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_loopback_round_trip() {
        let a = ControlSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let a_addr: SocketAddr = a.socket.local_addr().unwrap().as_socket().unwrap();
        let b = ControlSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        b.send_to(b"ping", a_addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let (n, _from) = a.recv_from(&mut buf).unwrap().expect("datagram pending");
        assert_eq!(&buf[..n], b"ping");
    }
}

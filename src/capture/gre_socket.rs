use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Raw `AF_INET/SOCK_RAW/IPPROTO_GRE` socket. The kernel delivers every GRE
/// datagram addressed to this host, IP header included, together with the
/// peer's source address.
pub struct GreSocket {
    fd: RawFd,
    closed: AtomicBool,
}

impl GreSocket {
    /// Requires CAP_NET_RAW (or root).
    pub fn open() -> io::Result<GreSocket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_GRE) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(GreSocket {
            fd,
            closed: AtomicBool::new(false),
        })
    }

    /// Blocking read of one datagram. Returns the byte count and the source
    /// address the kernel recorded for it.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Ipv4Addr)> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let peer = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok((n as usize, peer))
    }

    /// Close from any thread to unblock a pending `recv_from`. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
            libc::close(self.fd);
        }
    }
}

impl Drop for GreSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_requires_net_raw() {
        // Succeeds under CAP_NET_RAW, otherwise the kernel refuses; both are
        // well-defined outcomes here.
        match GreSocket::open() {
            Ok(sock) => sock.close(),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::PermissionDenied),
        }
    }
}

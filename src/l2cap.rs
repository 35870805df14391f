/* Seq-packet L2CAP sockets on the Bluetooth HID PSMs.
 *
 * The typed socket APIs stop at `AF_BLUETOOTH`, so the sockaddr and the
 * scatter/gather calls go through libc directly; every blocking syscall
 * retries on EINTR the way the rest of the daemon expects. */

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

use crate::addr::BdAddr;
use crate::transport::HidChannel;

/* HID profile PSMs. */
pub const PSM_HID_CONTROL: u16 = 0x11;
pub const PSM_HID_INTERRUPT: u16 = 0x13;

const LISTEN_BACKLOG: libc::c_int = 10;

/* struct sockaddr_l2 from the kernel's bluetooth headers. */
#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

impl SockaddrL2 {
    fn new(addr: BdAddr, psm: u16) -> SockaddrL2 {
        SockaddrL2 {
            l2_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: psm.to_le(),
            l2_bdaddr: addr.0,
            l2_cid: 0,
            l2_bdaddr_type: 0,
        }
    }
}

/* Protocol 0 on a Bluetooth seq-packet socket is BTPROTO_L2CAP. */
fn l2cap_socket() -> io::Result<OwnedFd> {
    socket(
        AddressFamily::Bluetooth,
        SockType::SeqPacket,
        SockFlag::empty(),
        None,
    )
    .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
}

pub struct L2capListener {
    fd: OwnedFd,
    psm: u16,
}

impl L2capListener {
    pub fn bind(addr: BdAddr, psm: u16) -> io::Result<L2capListener> {
        let fd = l2cap_socket()?;
        let sa = SockaddrL2::new(addr, psm);

        /* SAFETY: `sa` is a fully initialised sockaddr_l2 and the
         * length matches its size; `fd` is a live socket. */
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sa as *const SockaddrL2 as *const libc::sockaddr,
                mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        /* SAFETY: `fd` is a live, bound socket. */
        let rc = unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(L2capListener { fd, psm })
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    /* Accept the next connection, riding out the transient failures an
     * accept loop must survive. */
    pub fn accept(&self) -> io::Result<(L2capSocket, BdAddr)> {
        loop {
            let mut sa = SockaddrL2::new(BdAddr::ANY, 0);
            let mut len = mem::size_of::<SockaddrL2>() as libc::socklen_t;

            /* SAFETY: `sa` is valid storage of `len` bytes for the peer
             * address and both outlive the call. */
            let rc = unsafe {
                libc::accept(
                    self.fd.as_raw_fd(),
                    &mut sa as *mut SockaddrL2 as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if rc == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    _ => return Err(err),
                }
            }

            /* SAFETY: accept returned a fresh descriptor we now own. */
            let fd = unsafe { OwnedFd::from_raw_fd(rc) };
            return Ok((L2capSocket { fd }, BdAddr(sa.l2_bdaddr)));
        }
    }
}

/* One accepted channel. The descriptor closes when the socket is
 * dropped, which the session worker only does after both reader threads
 * are joined; mid-session teardown uses `shutdown`. */
pub struct L2capSocket {
    fd: OwnedFd,
}

impl HidChannel for L2capSocket {
    fn recv(&self, header: &mut u8, payload: &mut [u8]) -> io::Result<usize> {
        let mut iov = [
            libc::iovec {
                iov_base: header as *mut u8 as *mut libc::c_void,
                iov_len: 1,
            },
            libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            },
        ];
        /* SAFETY: msghdr is zero-initialised before the fields in use
         * are set. */
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;

        loop {
            /* SAFETY: the iovecs point into live buffers for the whole
             * call and msg_iovlen matches their count. */
            let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    fn send(&self, header: u8, payload: &[u8]) -> io::Result<usize> {
        let mut header = header;
        let mut iov = [
            libc::iovec {
                iov_base: &mut header as *mut u8 as *mut libc::c_void,
                iov_len: 1,
            },
            libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            },
        ];
        /* SAFETY: as in recv. */
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;

        loop {
            /* MSG_NOSIGNAL: a write to a dead peer must come back as
             * EPIPE, not as a process-killing signal. SAFETY: as in
             * recv; sendmsg does not write through the iovecs. */
            let n = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    fn shutdown(&self) {
        /* SAFETY: shutting down a live descriptor; a failure (already
         * reset by the peer) changes nothing. */
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

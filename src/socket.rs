//! IPv6 UDP sockets and multicast group membership (§4.3). Grounded on
//! `librecast.c::lc_socket_*`/`lc_channel_membership*` and the teacher's
//! `src/ip/udp.rs` socket-option style.

use std::net::Ipv6Addr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::sys;

pub const DEFAULT_MULTICAST_LOOP: bool = true;
pub const DEFAULT_MULTICAST_HOPS: i32 = 1;

pub(crate) struct ListenerHandle {
    pub(crate) thread: JoinHandle<()>,
    pub(crate) cancel_fd: RawFd,
}

/// Per-socket state held in the owning [`Context`]'s arena.
pub(crate) struct SocketState {
    pub(crate) id: u32,
    pub(crate) fd: RawFd,
    pub(crate) ifx: AtomicU32,
    pub(crate) bound: AtomicU32,
    pub(crate) join_set: Mutex<Vec<Ipv6Addr>>,
    pub(crate) listener: Mutex<Option<ListenerHandle>>,
}

impl SocketState {
    /// `lc_channel_membership`: joins `group` on the interface this socket
    /// is bound to, or on every multicast-capable interface otherwise
    /// (§4.3). Also updates the software join set used as a fallback when
    /// the kernel cannot filter per-socket (§4.3, §9).
    pub(crate) fn join(&self, group: Ipv6Addr) -> Result<()> {
        {
            let mut set = self.join_set.lock().unwrap();
            if !set.contains(&group) {
                set.push(group);
            }
        }
        self.membership(libc::IPV6_ADD_MEMBERSHIP, group)
            .map_err(Error::McastJoin)
    }

    /// `lc_channel_part`. Removes exactly the matching entry from the
    /// software join set, preserving the rest (spec §9 resolves the
    /// reference implementation's apparent head-pointer bug in its
    /// delete routine this way).
    pub(crate) fn part(&self, group: Ipv6Addr) -> Result<()> {
        self.join_set.lock().unwrap().retain(|g| *g != group);
        self.membership(libc::IPV6_DROP_MEMBERSHIP, group)
            .map_err(Error::McastPart)
    }

    fn membership(&self, opt: libc::c_int, group: Ipv6Addr) -> std::result::Result<(), errno::Errno> {
        let ifx = self.ifx.load(Ordering::SeqCst);
        if ifx != 0 {
            return sys::mcast_membership(self.fd, opt, group, ifx).map_err(|_| errno::errno());
        }
        let ifaces = sys::multicast_interfaces().map_err(|_| errno::errno())?;
        let mut joined_any = false;
        for iface in ifaces {
            if sys::mcast_membership(self.fd, opt, group, iface.index).is_ok() {
                joined_any = true;
            }
        }
        if joined_any {
            Ok(())
        } else {
            Err(errno::errno())
        }
    }

    /// Software join-set filter consulted by the listener when the
    /// platform lacks `IPV6_MULTICAST_ALL` (§4.3).
    pub(crate) fn accepts(&self, group: Ipv6Addr) -> bool {
        if sys::has_kernel_group_filter() {
            return true;
        }
        self.join_set.lock().unwrap().contains(&group)
    }

    fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().unwrap().take() {
            let _ = unsafe { libc::write(handle.cancel_fd, [1u8].as_ptr() as *const _, 1) };
            let _ = handle.thread.join();
            sys::close(handle.cancel_fd);
        }
        sys::close(self.fd);
    }
}

/// A handle to an IPv6 UDP endpoint owned by a [`Context`]. Not `Clone`:
/// one handle per underlying file descriptor, mirroring the reference
/// implementation's unique `lc_socket_t*`.
pub struct Socket {
    ctx: Context,
    idx: usize,
}

impl Socket {
    /// `lc_socket_new`.
    pub fn new(ctx: &Context) -> Result<Socket> {
        let fd = sys::new_udp6_socket(DEFAULT_MULTICAST_LOOP, DEFAULT_MULTICAST_HOPS)?;
        let id = crate::ids::next_sock_id();
        let state = SocketState {
            id,
            fd,
            ifx: AtomicU32::new(0),
            bound: AtomicU32::new(0),
            join_set: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        };
        let idx = ctx.insert_socket(state);
        debug!(sock_id = id, "socket created");
        Ok(Socket {
            ctx: ctx.clone(),
            idx,
        })
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn id(&self) -> u32 {
        self.ctx.with_socket(self.idx, |s| s.id).unwrap_or(0)
    }

    pub(crate) fn idx(&self) -> usize {
        self.idx
    }

    pub fn raw_fd(&self) -> RawFd {
        self.ctx.with_socket(self.idx, |s| s.fd).unwrap_or(-1)
    }

    pub fn bound_count(&self) -> u32 {
        self.ctx
            .with_socket(self.idx, |s| s.bound.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// `lc_socket_bind`: restricts outbound multicast to interface `ifx`
    /// (0 = unspecified/all) and records it so receive can be filtered to
    /// that interface too (§4.3 "Interface-scoped receive").
    pub fn bind(&self, ifx: u32) -> Result<()> {
        let fd = self.raw_fd();
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_MULTICAST_IF,
                &ifx as *const _ as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::SetSockOpt(errno::errno()));
        }
        self.ctx
            .with_socket(self.idx, |s| s.ifx.store(ifx, Ordering::SeqCst));
        Ok(())
    }

    pub fn interface_index(&self) -> u32 {
        self.ctx
            .with_socket(self.idx, |s| s.ifx.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// `lc_socket_loop`.
    pub fn set_loop(&self, enabled: bool) -> Result<()> {
        self.setopt_bool(libc::IPV6_MULTICAST_LOOP, enabled)
    }

    /// `lc_socket_ttl`.
    pub fn set_ttl(&self, hops: i32) -> Result<()> {
        self.setopt_int(libc::IPV6_MULTICAST_HOPS, hops)
    }

    fn setopt_bool(&self, name: libc::c_int, val: bool) -> Result<()> {
        self.setopt_int(name, val as i32)
    }

    fn setopt_int(&self, name: libc::c_int, val: i32) -> Result<()> {
        let fd = self.raw_fd();
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                name,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(Error::SetSockOpt(errno::errno()))
        } else {
            Ok(())
        }
    }

    /// `lc_socket_setopt`.
    pub fn setopt_raw(&self, name: libc::c_int, val: &[u8]) -> Result<()> {
        let fd = self.raw_fd();
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                name,
                val.as_ptr() as *const libc::c_void,
                val.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(Error::SetSockOpt(errno::errno()))
        } else {
            Ok(())
        }
    }

    /// `lc_socket_getopt`.
    pub fn getopt_raw(&self, name: libc::c_int, buf: &mut [u8]) -> Result<usize> {
        let fd = self.raw_fd();
        let mut len = buf.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IPV6,
                name,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(len as usize)
        }
    }

    /// `lc_channel_bind`: binds the socket's endpoint to the channel's
    /// port on first use, and accounts the channel against this socket's
    /// `bound` counter on every call.
    pub(crate) fn bind_channel(&self, chan: &Channel) -> Result<()> {
        let already_bound = self.bound_count() > 0;
        if !already_bound {
            let port = sys::port_of(&chan.sockaddr());
            sys::set_reuse_addr_port(self.raw_fd())?;
            sys::bind_wildcard(self.raw_fd(), port)?;
        }
        chan.set_sock_idx(self.idx);
        self.ctx
            .with_socket(self.idx, |s| s.bound.fetch_add(1, Ordering::SeqCst));
        Ok(())
    }

    /// `lc_socket_send`: sends `buf` to every channel bound to this
    /// socket (§4.6).
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        self.ctx.fanout_send(self.idx, buf)
    }

    /// `lc_socket_sendmsg`: vectored counterpart to [`Socket::send`] — the
    /// buffers are written out in one `sendmsg(2)` per bound channel with
    /// no message-framing header applied.
    pub fn sendmsg(&self, bufs: &[std::io::IoSlice]) -> Result<usize> {
        self.ctx.fanout_sendmsg(self.idx, bufs)
    }

    /// `lc_socket_recv`: a single raw, blocking receive, bypassing the
    /// background listener and its message framing entirely. Filtered to
    /// this socket's bound interface, if any (§4.3).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.raw_fd();
        let ifx = self.interface_index();
        let mut iov = [libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        }];
        sys::recv_filtered(fd, ifx, &mut iov).map_err(|_| Error::last_os_error())
    }

    /// `lc_socket_recvmsg`: vectored counterpart to [`Socket::recv`].
    pub fn recvmsg(&self, bufs: &mut [std::io::IoSliceMut]) -> Result<usize> {
        let fd = self.raw_fd();
        let ifx = self.interface_index();
        let mut iov: Vec<libc::iovec> = bufs
            .iter_mut()
            .map(|b| libc::iovec {
                iov_base: b.as_mut_ptr() as *mut libc::c_void,
                iov_len: b.len(),
            })
            .collect();
        sys::recv_filtered(fd, ifx, &mut iov).map_err(|_| Error::last_os_error())
    }

    /// `lc_socket_listen`.
    pub fn listen<M, E>(&self, on_msg: M, on_err: E) -> Result<()>
    where
        M: Fn(crate::message::Message) + Send + 'static,
        E: Fn(Error) + Send + 'static,
    {
        let already = self
            .ctx
            .with_socket(self.idx, |s| s.listener.lock().unwrap().is_some())
            .ok_or(Error::SocketRequired)?;
        if already {
            return Err(Error::AlreadyListening);
        }
        let handle = crate::listener::spawn(&self.ctx, self.idx, Box::new(on_msg), Box::new(on_err))?;
        self.ctx
            .with_socket(self.idx, |s| *s.listener.lock().unwrap() = Some(handle));
        trace!(sock_id = self.id(), "listener started");
        Ok(())
    }

    /// `lc_socket_listen_cancel`: idempotent.
    pub fn listen_cancel(&self) -> Result<()> {
        let handle = self
            .ctx
            .with_socket(self.idx, |s| s.listener.lock().unwrap().take())
            .flatten();
        let Some(handle) = handle else {
            return Ok(());
        };
        let rc = unsafe { libc::write(handle.cancel_fd, [1u8].as_ptr() as *const _, 1) };
        if rc < 0 {
            return Err(Error::CancelFailed(errno::errno()));
        }
        let join_result = handle.thread.join();
        sys::close(handle.cancel_fd);
        if join_result.is_err() {
            warn!(sock_id = self.id(), "listener thread panicked");
            return Err(Error::JoinFailed);
        }
        Ok(())
    }

    /// `lc_socket_close`: cancels the listener, drops the software join
    /// set (closing the fd implicitly leaves any kernel-level
    /// memberships, exactly as in the reference implementation), and
    /// removes the socket from its context.
    pub fn close(self) -> Result<()> {
        self.listen_cancel()?;
        self.ctx
            .with_socket(self.idx, |s| s.join_set.lock().unwrap().clear());
        let fd = self.raw_fd();
        self.ctx.remove_socket(self.idx);
        sys::close(fd);
        Ok(())
    }
}

pub(crate) fn shutdown_state(state: &SocketState) {
    state.shutdown();
}

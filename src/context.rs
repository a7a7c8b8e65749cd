//! The top-level container (§3 "Context"). Grounded on
//! `librecast.c::lc_ctx_*`; the intrusive `sock_list`/`chan_list` become
//! `RwLock`-guarded [`Arena`]s (spec §9).

use std::net::Ipv6Addr;
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, trace};

use crate::arena::Arena;
use crate::channel::{Channel, ChannelState};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::socket::SocketState;
use crate::{ids, sys};

struct Inner {
    id: u32,
    channels: RwLock<Arena<ChannelState>>,
    sockets: RwLock<Arena<SocketState>>,
}

/// A top-level container owning a set of sockets and a set of channels
/// (§3). Cloning a `Context` clones the handle; all clones refer to the
/// same underlying state, and the state is torn down when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Context(Arc<Inner>);

impl Context {
    /// `lc_ctx_new`.
    pub fn new() -> Self {
        let id = ids::next_ctx_id();
        debug!(ctx_id = id, "context created");
        Context(Arc::new(Inner {
            id,
            channels: RwLock::new(Arena::new()),
            sockets: RwLock::new(Arena::new()),
        }))
    }

    /// `lc_ctx_get_id`.
    pub fn id(&self) -> u32 {
        self.0.id
    }

    /// A non-owning handle a listener worker can hold across its blocking
    /// receive loop without keeping the context alive by itself (spec §3
    /// "Drop tears down every owned socket"): a worker holding a strong
    /// clone would make `Arc::strong_count` never reach 1, so the last
    /// application-side handle's drop would never run teardown.
    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.0))
    }

    pub(crate) fn insert_channel(&self, state: ChannelState) -> usize {
        self.0.channels.write().unwrap().insert(state)
    }

    pub(crate) fn insert_socket(&self, state: SocketState) -> usize {
        self.0.sockets.write().unwrap().insert(state)
    }

    pub(crate) fn with_channel<R>(&self, idx: usize, f: impl FnOnce(&ChannelState) -> R) -> Option<R> {
        self.0.channels.read().unwrap().get(idx).map(f)
    }

    pub(crate) fn with_channel_mut<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&mut ChannelState) -> R,
    ) -> Option<R> {
        self.0.channels.write().unwrap().get_mut(idx).map(f)
    }

    pub(crate) fn with_socket<R>(&self, idx: usize, f: impl FnOnce(&SocketState) -> R) -> Option<R> {
        self.0.sockets.read().unwrap().get(idx).map(f)
    }

    /// `lc_channel_free`.
    pub(crate) fn remove_channel(&self, idx: usize) {
        self.0.channels.write().unwrap().remove(idx);
    }

    /// `lc_socket_close`.
    pub(crate) fn remove_socket(&self, idx: usize) {
        self.0.sockets.write().unwrap().remove(idx);
    }

    /// `lc_channel_by_address`.
    pub(crate) fn find_channel_by_group(&self, group: Ipv6Addr) -> Option<Channel> {
        let channels = self.0.channels.read().unwrap();
        let idx = channels
            .iter()
            .enumerate()
            .find(|(_, c)| sys::group_of(&c.sa) == group)
            .map(|(idx, _)| idx)?;
        drop(channels);
        Some(crate::channel::Channel::from_parts(self.clone(), idx))
    }

    pub(crate) fn join_channel(&self, sidx: usize, chan: &Channel) -> Result<()> {
        let group = chan.group();
        self.with_socket(sidx, |s| s.join(group))
            .ok_or(Error::SocketRequired)?
    }

    pub(crate) fn part_channel(&self, sidx: usize, chan: &Channel) -> Result<()> {
        let group = chan.group();
        self.with_socket(sidx, |s| s.part(group))
            .ok_or(Error::SocketRequired)?
    }

    /// `lc_msg_send`.
    pub(crate) fn send_on(&self, sidx: usize, chan: &Channel, msg: &Message) -> Result<usize> {
        let sa = chan.sockaddr();
        let fd = self
            .with_socket(sidx, |s| s.fd)
            .ok_or(Error::SocketRequired)?;
        let seq = chan.next_send_seq().ok_or(Error::SocketRequired)?;
        let timestamp = if msg.timestamp() != 0 {
            msg.timestamp()
        } else {
            crate::message::now_nanos()?
        };
        let nonce = rand::random::<u64>();
        let header = crate::message::Header {
            timestamp,
            seq,
            nonce,
            op: msg.opcode().to_wire(),
            len: msg.data().len() as u64,
        };
        let mut buf = Vec::with_capacity(crate::message::HEADER_LEN + msg.data().len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(msg.data());
        trace!(chan_id = chan.id(), seq, len = msg.data().len(), "sending");
        sys::sendto(fd, &buf, &sa).map_err(|_| Error::last_os_error())
    }

    /// `lc_socket_send`/`lc_socket_sendmsg` (§4.6): sends `buf` to every
    /// channel currently bound to `sock`. A single failure discards the
    /// partial byte count and aborts, mirroring the C implementation.
    pub(crate) fn fanout_send(&self, sidx: usize, buf: &[u8]) -> Result<usize> {
        let fd = self
            .with_socket(sidx, |s| s.fd)
            .ok_or(Error::SocketRequired)?;
        let targets: Vec<libc::sockaddr_in6> = {
            let channels = self.0.channels.read().unwrap();
            channels
                .iter()
                .filter(|c| *c.sock_idx.lock().unwrap() == Some(sidx))
                .map(|c| c.sa)
                .collect()
        };
        let mut total = 0usize;
        for sa in targets {
            total += sys::sendto(fd, buf, &sa).map_err(|_| Error::last_os_error())?;
        }
        Ok(total)
    }

    /// `lc_socket_sendmsg`: like [`Context::fanout_send`], but vectored and
    /// with no message-framing header — a raw passthrough to `sendmsg(2)`
    /// for every channel bound to `sock`.
    pub(crate) fn fanout_sendmsg(&self, sidx: usize, iov: &[std::io::IoSlice]) -> Result<usize> {
        let fd = self
            .with_socket(sidx, |s| s.fd)
            .ok_or(Error::SocketRequired)?;
        let targets: Vec<libc::sockaddr_in6> = {
            let channels = self.0.channels.read().unwrap();
            channels
                .iter()
                .filter(|c| *c.sock_idx.lock().unwrap() == Some(sidx))
                .map(|c| c.sa)
                .collect()
        };
        let mut total = 0usize;
        for sa in targets {
            total += sys::sendmsg_vectored(fd, iov, &sa).map_err(|_| Error::last_os_error())?;
        }
        Ok(total)
    }

    /// Cleans up every owned socket (stopping its listener) and channel.
    fn teardown(&self) {
        let sockets = self.0.sockets.write().unwrap().drain();
        for sock in &sockets {
            crate::socket::shutdown_state(sock);
        }
        let _ = self.0.channels.write().unwrap().drain();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!(ctx_id = self.id, "context dropped");
    }
}

impl std::ops::Drop for Context {
    fn drop(&mut self) {
        // Only the last handle tears anything down; earlier clones just
        // decrement the Arc refcount.
        if Arc::strong_count(&self.0) == 1 {
            self.teardown();
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak reference to a [`Context`]'s shared state, upgraded back to a
/// strong [`Context`] only for the duration of a single listener
/// iteration. See [`Context::downgrade`].
pub(crate) struct WeakContext(Weak<Inner>);

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<Context> {
        self.0.upgrade().map(Context)
    }
}

//! Channels: named group endpoints and the address-derivation operators
//! that create them (§4.1, §4.2). Grounded on `librecast.c::lc_channel_*`.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngCore;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::hash;
use crate::sys;

/// Default base multicast address (`ff1e::`, global-scope admin, §6).
pub const DEFAULT_BASE_ADDR: Ipv6Addr = Ipv6Addr::new(0xff1e, 0, 0, 0, 0, 0, 0, 0);

/// Implementation-defined default port (§6).
pub const DEFAULT_PORT: u16 = 4242;

/// Per-channel state held in the owning [`Context`]'s arena. Not public:
/// applications interact through the [`Channel`] handle.
pub(crate) struct ChannelState {
    pub(crate) id: u32,
    pub(crate) sock_idx: std::sync::Mutex<Option<usize>>,
    pub(crate) sa: libc::sockaddr_in6,
    pub(crate) uri: Option<String>,
    pub(crate) seq: AtomicU64,
    pub(crate) nonce: AtomicU64,
}

/// A handle to a named group endpoint owned by a [`Context`]. Unlike
/// [`Context`] and [`crate::socket::Socket`], `Channel` is not `Clone`:
/// the reference implementation hands out one unique pointer per channel
/// with an explicit `lc_channel_free`, and [`Channel::free`] mirrors that
/// by consuming the handle.
pub struct Channel {
    ctx: Context,
    idx: usize,
}

fn derive_group(base: Ipv6Addr, name: &[u8], flags: u32) -> Result<Ipv6Addr> {
    let mut input = Vec::with_capacity(name.len() + 4);
    input.extend_from_slice(name);
    // Flags are hashed in native-endian order, matching librecast.c's raw
    // `memcpy` of the `unsigned int` into the hash state.
    input.extend_from_slice(&flags.to_ne_bytes());
    let digest = hash::hash16(&input)?;
    let mut octets = base.octets();
    for i in 2..16 {
        octets[i] ^= digest[i];
    }
    Ok(Ipv6Addr::from(octets))
}

impl Channel {
    /// `lc_channel_nnew`: hashes `name` (with `flags`) against `base` to
    /// produce the group address, then registers a new channel for it.
    pub fn nnew_with(ctx: &Context, base: Ipv6Addr, name: &[u8], flags: u32) -> Result<Channel> {
        let group = derive_group(base, name, flags)?;
        let sa = sys::sockaddr_in6(group, DEFAULT_PORT);
        Self::init_raw(ctx, sa, None)
    }

    /// `lc_channel_nnew`: byte-slice name, default base address, no flags.
    pub fn nnew(ctx: &Context, name: &[u8]) -> Result<Channel> {
        Self::nnew_with(ctx, DEFAULT_BASE_ADDR, name, 0)
    }

    /// `lc_channel_new`: string name, URI retained for introspection.
    pub fn new(ctx: &Context, name: &str) -> Result<Channel> {
        let chan = Self::nnew(ctx, name.as_bytes())?;
        chan.ctx
            .with_channel_mut(chan.idx, |c| c.uri = Some(name.to_string()))
            .ok_or(Error::InvalidParams)?;
        Ok(chan)
    }

    /// `lc_channel_init`: registers a channel directly from a caller-built
    /// `sockaddr_in6` (e.g. for interop with externally derived groups).
    pub fn init(ctx: &Context, sa: libc::sockaddr_in6) -> Result<Channel> {
        Self::init_raw(ctx, sa, None)
    }

    /// `lc_channel_random`: 14 random bytes hashed through the same
    /// derivation procedure as a named channel, collision-free with
    /// overwhelming probability.
    pub fn random(ctx: &Context) -> Result<Channel> {
        let mut buf = [0u8; 14];
        rand::thread_rng().fill_bytes(&mut buf);
        Self::nnew(ctx, &buf)
    }

    /// `lc_channel_copy`: a fresh channel sharing `base`'s group address.
    pub fn copy(ctx: &Context, base: &Channel) -> Result<Channel> {
        let sa = base.ctx.with_channel(base.idx, |c| c.sa).ok_or(Error::InvalidParams)?;
        Self::init_raw(ctx, sa, None)
    }

    /// `lc_channel_sideband`: preserves bytes 0-7 of `base`'s group and
    /// writes `band` into bytes 8-15 in the host's native byte order
    /// (§4.1, §9 — the byte-order contract is intentionally host-local and
    /// not normalised, matching the reference implementation exactly).
    pub fn sideband(base: &Channel, band: u64) -> Result<Channel> {
        let mut sa = base.ctx.with_channel(base.idx, |c| c.sa).ok_or(Error::InvalidParams)?;
        let band_bytes = band.to_ne_bytes();
        sa.sin6_addr.s6_addr[8..16].copy_from_slice(&band_bytes);
        Self::init_raw(&base.ctx, sa, None)
    }

    /// `lc_channel_sidehash`: keyed-hashes the base group address with
    /// `key`, preserving bytes 0-1.
    pub fn sidehash(base: &Channel, key: &[u8]) -> Result<Channel> {
        let mut sa = base.ctx.with_channel(base.idx, |c| c.sa).ok_or(Error::InvalidParams)?;
        let digest = hash::keyed_hash16(key, &sa.sin6_addr.s6_addr)?;
        sa.sin6_addr.s6_addr[2..16].copy_from_slice(&digest[2..16]);
        Self::init_raw(&base.ctx, sa, None)
    }

    fn init_raw(ctx: &Context, sa: libc::sockaddr_in6, uri: Option<String>) -> Result<Channel> {
        let id = crate::ids::next_chan_id();
        let state = ChannelState {
            id,
            sock_idx: std::sync::Mutex::new(None),
            sa,
            uri,
            seq: AtomicU64::new(0),
            nonce: AtomicU64::new(0),
        };
        let idx = ctx.insert_channel(state);
        Ok(Channel::from_parts(ctx.clone(), idx))
    }

    pub(crate) fn from_parts(ctx: Context, idx: usize) -> Channel {
        Channel { ctx, idx }
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn id(&self) -> u32 {
        self.ctx.with_channel(self.idx, |c| c.id).unwrap_or(0)
    }

    pub fn uri(&self) -> Option<String> {
        self.ctx.with_channel(self.idx, |c| c.uri.clone()).flatten()
    }

    pub fn group(&self) -> Ipv6Addr {
        self.ctx
            .with_channel(self.idx, |c| sys::group_of(&c.sa))
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }

    pub fn sockaddr(&self) -> libc::sockaddr_in6 {
        self.ctx
            .with_channel(self.idx, |c| c.sa)
            .unwrap_or_else(|| unsafe { std::mem::zeroed() })
    }

    pub fn socket_id(&self) -> Option<u32> {
        self.ctx
            .with_channel(self.idx, |c| *c.sock_idx.lock().unwrap())
            .flatten()
            .and_then(|sidx| self.ctx.with_socket(sidx, |s| s.id))
    }

    pub(crate) fn idx(&self) -> usize {
        self.idx
    }

    pub(crate) fn seq(&self) -> Option<u64> {
        self.ctx.with_channel(self.idx, |c| c.seq.load(Ordering::SeqCst))
    }

    /// Advances the channel's Lamport sequence to `max(local, remote) + 1`
    /// (§4.5, §5 "Ordering") and records `nonce`. Returns the new sequence.
    pub(crate) fn advance_seq(&self, remote_seq: u64, nonce: u64) -> Option<u64> {
        self.ctx.with_channel(self.idx, |c| {
            let cur = c.seq.load(Ordering::SeqCst);
            let next = cur.max(remote_seq) + 1;
            c.seq.store(next, Ordering::SeqCst);
            c.nonce.store(nonce, Ordering::SeqCst);
            next
        })
    }

    pub(crate) fn next_send_seq(&self) -> Option<u64> {
        self.ctx.with_channel(self.idx, |c| c.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// `lc_channel_bind`: associates this channel with `sock`, binding the
    /// socket's endpoint on first use.
    pub fn bind(&self, sock: &crate::socket::Socket) -> Result<()> {
        sock.bind_channel(self)
    }

    /// `lc_channel_unbind`.
    pub fn unbind(&self) -> Result<()> {
        let prev = self
            .ctx
            .with_channel(self.idx, |c| c.sock_idx.lock().unwrap().take())
            .flatten();
        if let Some(sidx) = prev {
            self.ctx.with_socket(sidx, |s| {
                s.bound.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    /// `lc_channel_join`.
    pub fn join(&self) -> Result<()> {
        let sidx = self.bound_socket_idx()?;
        self.ctx.join_channel(sidx, self)
    }

    /// `lc_channel_part`.
    pub fn part(&self) -> Result<()> {
        let sidx = self.bound_socket_idx()?;
        self.ctx.part_channel(sidx, self)
    }

    fn bound_socket_idx(&self) -> Result<usize> {
        self.ctx
            .with_channel(self.idx, |c| *c.sock_idx.lock().unwrap())
            .flatten()
            .ok_or(Error::SocketRequired)
    }

    pub(crate) fn set_sock_idx(&self, sidx: usize) {
        self.ctx.with_channel(self.idx, |c| {
            *c.sock_idx.lock().unwrap() = Some(sidx);
        });
    }

    /// `lc_msg_send`: composes the wire header, appends the payload, and
    /// transmits to the channel's group (§4.4).
    pub fn send(&self, msg: &crate::message::Message) -> Result<usize> {
        let sidx = self.bound_socket_idx()?;
        self.ctx.send_on(sidx, self, msg)
    }

    /// `lc_channel_free`: unbinds (if bound) and removes the channel from
    /// its context.
    pub fn free(self) {
        let _ = self.unbind();
        self.ctx.remove_channel(self.idx);
    }
}

/// `lc_channel_by_address`: linear scan over the context's channels,
/// matching the reference implementation's list walk (channel counts per
/// context are small, §4.2).
pub(crate) fn find_by_group(ctx: &Context, group: Ipv6Addr) -> Option<Channel> {
    ctx.find_channel_by_group(group)
}

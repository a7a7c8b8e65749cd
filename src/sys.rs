//! Thin raw-syscall helpers shared by [`crate::socket`] and
//! [`crate::listener`]: `sockaddr_in6` construction, `recvmsg`/`sendmsg`
//! with ancillary `IPV6_PKTINFO` data, and multicast-capable interface
//! enumeration via `getifaddrs`. Grounded on the teacher's `src/sa_ops/`
//! and `src/ffi/` raw-conversion helpers, generalised from its generic
//! `SockAddr` trait to the single `sockaddr_in6` shape this crate needs.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::net::Ipv6Addr;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Builds a zeroed `sockaddr_in6` for `addr`:`port`.
pub(crate) fn sockaddr_in6(addr: Ipv6Addr, port: u16) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = port.to_be();
    sa.sin6_addr = libc::in6_addr {
        s6_addr: addr.octets(),
    };
    sa
}

pub(crate) fn group_of(sa: &libc::sockaddr_in6) -> Ipv6Addr {
    Ipv6Addr::from(sa.sin6_addr.s6_addr)
}

pub(crate) fn port_of(sa: &libc::sockaddr_in6) -> u16 {
    u16::from_be(sa.sin6_port)
}

/// Creates an IPv6 UDP socket with the crate's standard defaults applied
/// (§4.3): `IPV6_RECVPKTINFO`, multicast loop, multicast hops, and
/// `IPV6_MULTICAST_ALL` disabled where the platform defines it. The
/// listener gates every read behind `poll()`, so the socket stays
/// blocking.
pub(crate) fn new_udp6_socket(loop_enabled: bool, hops: i32) -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }

    let set = |name: libc::c_int, val: libc::c_int| -> Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                name,
                &val as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    };

    #[cfg(target_os = "linux")]
    {
        // Available from Linux 4.2 onwards; best-effort, a software join
        // set covers platforms/kernels where this option does not exist.
        let _ = set(libc::IPV6_MULTICAST_ALL, 0);
    }

    if let Err(e) = set(libc::IPV6_RECVPKTINFO, 1)
        .and_then(|_| set(libc::IPV6_MULTICAST_LOOP, loop_enabled as libc::c_int))
        .and_then(|_| set(libc::IPV6_MULTICAST_HOPS, hops))
    {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    Ok(fd)
}

/// `true` when this platform defines `IPV6_MULTICAST_ALL`, i.e. the kernel
/// can be told to deliver only explicitly joined groups per socket. When
/// `false`, callers must keep a software join set (§4.3).
pub(crate) const fn has_kernel_group_filter() -> bool {
    cfg!(target_os = "linux")
}

pub(crate) fn set_reuse_addr_port(fd: RawFd) -> Result<()> {
    let opt: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::last_os_error());
    }
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Binds `fd` to `::` on `port`, ignoring "already bound" (`EINVAL`) the
/// way `librecast.c::lc_socket_bind_addr` does.
pub(crate) fn bind_wildcard(fd: RawFd, port: u16) -> Result<()> {
    let sa = sockaddr_in6(Ipv6Addr::UNSPECIFIED, port);
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let err = errno::errno();
        if err.0 != libc::EINVAL {
            return Err(Error::SocketBind(err));
        }
    }
    Ok(())
}

/// One multicast-capable IPv6-up interface, as reported by `getifaddrs`.
pub(crate) struct Iface {
    pub index: u32,
}

/// Enumerates every interface that is up, multicast-capable, and has an
/// IPv6 address, mirroring `librecast.c::lc_channel_membership_all`'s
/// `getifaddrs` walk.
pub(crate) fn multicast_interfaces() -> Result<Vec<Iface>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(Error::last_os_error());
    }
    let mut out = Vec::new();
    let mut cur = head;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        let wanted = libc::IFF_MULTICAST as libc::c_uint | libc::IFF_UP as libc::c_uint;
        let flags = ifa.ifa_flags as libc::c_uint;
        if flags & wanted == wanted && !ifa.ifa_addr.is_null() {
            let family = unsafe { (*ifa.ifa_addr).sa_family } as i32;
            if family == libc::AF_INET6 {
                let name = unsafe { CStr::from_ptr(ifa.ifa_name) };
                let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
                if index != 0 {
                    out.push(Iface { index });
                }
            }
        }
        cur = ifa.ifa_next;
    }
    unsafe { libc::freeifaddrs(head) };
    Ok(out)
}

/// Issues `IPV6_JOIN_GROUP`/`IPV6_LEAVE_GROUP` for `group` on interface
/// `ifindex` (0 meaning the unspecified/default interface for a
/// single-interface request).
pub(crate) fn mcast_membership(
    fd: RawFd,
    opt: libc::c_int,
    group: Ipv6Addr,
    ifindex: u32,
) -> io::Result<()> {
    let req = libc::ipv6_mreq {
        ipv6mr_multiaddr: libc::in6_addr {
            s6_addr: group.octets(),
        },
        ipv6mr_interface: ifindex,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            opt,
            &req as *const _ as *const libc::c_void,
            mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Result of a single `recvmsg` with ancillary `IPV6_PKTINFO` data.
pub(crate) struct RecvResult {
    pub bytes: usize,
    pub src: Ipv6Addr,
    pub dst: Option<Ipv6Addr>,
    pub pktinfo_ifindex: Option<u32>,
}

/// Peeks the size of the next datagram with `MSG_PEEK | MSG_TRUNC`, the
/// way `librecast.c::lc_msg_recv` sizes its payload allocation before the
/// real `recvmsg`.
pub(crate) fn peek_len(fd: RawFd) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, std::ptr::null_mut(), 0, libc::MSG_PEEK | libc::MSG_TRUNC) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Dequeues and discards the next datagram without copying it anywhere,
/// for a short/malformed datagram that `peek_len` rejected before ever
/// consuming it off the socket's receive queue (§6 "silently discarded").
pub(crate) fn discard_datagram(fd: RawFd) -> io::Result<()> {
    let n = unsafe { libc::recv(fd, std::ptr::null_mut(), 0, 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Receives into `header_buf` + `payload_buf` as a two-segment scatter,
/// recovering the destination group (`IPV6_PKTINFO`) and source address
/// from ancillary/`from` data.
pub(crate) fn recvmsg_with_pktinfo(
    fd: RawFd,
    header_buf: &mut [u8],
    payload_buf: &mut [u8],
) -> io::Result<RecvResult> {
    let mut from: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    let mut ctl = [0u8; 256];
    let mut iov = [
        libc::iovec {
            iov_base: header_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: header_buf.len(),
        },
        libc::iovec {
            iov_base: payload_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: payload_buf.len(),
        },
    ];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut from as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len() as _;
    msg.msg_control = ctl.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = ctl.len() as _;

    let bytes = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if bytes < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut dst = None;
    let mut pktinfo_ifindex = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let c = unsafe { &*cmsg };
        if c.cmsg_level == libc::IPPROTO_IPV6 && c.cmsg_type == libc::IPV6_PKTINFO {
            let pi = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
            dst = Some(Ipv6Addr::from(pi.ipi6_addr.s6_addr));
            pktinfo_ifindex = Some(pi.ipi6_ifindex as u32);
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok(RecvResult {
        bytes: bytes as usize,
        src: Ipv6Addr::from(from.sin6_addr.s6_addr),
        dst,
        pktinfo_ifindex,
    })
}

/// Sends `buf` to `sa` with plain `sendto`, as the C implementation's
/// `lc_msg_sendto` does.
pub(crate) fn sendto(fd: RawFd, buf: &[u8], sa: &libc::sockaddr_in6) -> io::Result<usize> {
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            sa as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Sends a vectored buffer to `sa` with plain `sendmsg`, the raw
/// counterpart to [`sendto`] used by the socket-level `sendmsg` (no
/// message-framing header involved), mirroring
/// `librecast.c::lc_channel_sendmsg`.
pub(crate) fn sendmsg_vectored(fd: RawFd, iov: &[io::IoSlice], sa: &libc::sockaddr_in6) -> io::Result<usize> {
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = sa as *const _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = iov.len() as _;
    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Receives into `iov`, retrying until the datagram's `IPV6_PKTINFO`
/// ancillary data reports it arrived on interface `ifx` (or returning the
/// first datagram unconditionally when `ifx == 0`), matching
/// `librecast.c::lc_socket_recvmsg_if`/`lc_socket_recvmsg`. This is the
/// raw socket-level receive path used outside the listener's dispatch
/// loop: no message-header decoding, no software join-set filtering.
pub(crate) fn recv_filtered(fd: RawFd, ifx: u32, iov: &mut [libc::iovec]) -> io::Result<usize> {
    loop {
        let mut ctl = [0u8; 256];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len() as _;
        if ifx != 0 {
            msg.msg_control = ctl.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = ctl.len() as _;
        }

        let bytes = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if bytes < 0 {
            return Err(io::Error::last_os_error());
        }
        if ifx == 0 {
            return Ok(bytes as usize);
        }

        let mut got = None;
        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let c = unsafe { &*cmsg };
            if c.cmsg_level == libc::IPPROTO_IPV6 && c.cmsg_type == libc::IPV6_PKTINFO {
                let pi = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
                got = Some(pi.ipi6_ifindex as u32);
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }
        if got == Some(ifx) {
            return Ok(bytes as usize);
        }
    }
}

/// Creates a connected pair of local sockets used purely as a cross-thread
/// wakeup for listener cancellation (the self-pipe trick), replacing the
/// reference implementation's `pthread_cancel`.
pub(crate) fn socketpair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok((fds[0], fds[1]))
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

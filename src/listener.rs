//! The per-socket listener worker and its dispatch table (§4.5).
//! Grounded on `librecast.c::lc_socket_listen_thread`/`process_msg`/
//! `lc_op_*_handler`. The reference implementation's single
//! `pthread_cancel` testable point becomes a `poll()` wait over the
//! socket fd and a self-pipe (§4.4, §9 "Cancellation discipline"); its two
//! LIFO `pthread_cleanup_push` handlers become ordinary Rust ownership
//! (the in-flight [`Message`] and the boxed call record are both local
//! values, dropped exactly once whether the loop returns normally or a
//! callback panics and unwinds through it).

use std::io;
use std::net::Ipv6Addr;
use std::os::unix::io::RawFd;

use tracing::{debug, trace, warn};

use crate::channel::{self, Channel};
use crate::context::{Context, WeakContext};
use crate::error::Error;
use crate::message::{Header, Message, Opcode, HEADER_LEN};
use crate::socket::ListenerHandle;
use crate::sys;

type MsgCallback = Box<dyn Fn(Message) + Send>;
type ErrCallback = Box<dyn Fn(Error) + Send>;

/// The heap-allocated call record owned by the worker thread
/// (`lc_socket_call_t` in the reference implementation).
struct CallRecord {
    on_msg: MsgCallback,
    on_err: ErrCallback,
    sock_id: u32,
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        trace!(sock_id = self.sock_id, "listener call record dropped");
    }
}

/// `lc_socket_listen`: spawns the single background worker for `sock_idx`.
pub(crate) fn spawn(
    ctx: &Context,
    sock_idx: usize,
    on_msg: MsgCallback,
    on_err: ErrCallback,
) -> crate::error::Result<ListenerHandle> {
    let (cancel_read, cancel_write) = sys::socketpair().map_err(|_| Error::last_os_error())?;
    let fd = ctx
        .with_socket(sock_idx, |s| s.fd)
        .ok_or(Error::SocketRequired)?;
    let sock_id = ctx.with_socket(sock_idx, |s| s.id).unwrap_or(0);
    let weak = ctx.downgrade();

    let thread = std::thread::spawn(move || {
        let record = CallRecord {
            on_msg,
            on_err,
            sock_id,
        };
        run(weak, sock_idx, fd, cancel_read, &record);
        sys::close(cancel_read);
    });

    Ok(ListenerHandle {
        thread,
        cancel_fd: cancel_write,
    })
}

/// Holds only a [`WeakContext`] across the blocking wait: a strong clone
/// here would keep the owning `Context`'s refcount above 1 for as long as
/// the worker runs, so a dropped application-side handle could never
/// observe itself as the last owner and teardown would never fire.
fn run(weak: WeakContext, sock_idx: usize, fd: RawFd, cancel_fd: RawFd, record: &CallRecord) {
    loop {
        match poll_wait(fd, cancel_fd) {
            Ok(true) => {
                debug!(sock_id = record.sock_id, "listener cancelled");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                (record.on_err)(Error::Io(e));
                continue;
            }
        }

        let Some(ctx) = weak.upgrade() else {
            debug!(sock_id = record.sock_id, "context gone, stopping listener");
            return;
        };

        match receive_one(&ctx, sock_idx, fd) {
            Ok(Some(msg)) => dispatch(&ctx, record, msg),
            Ok(None) => {} // short/filtered datagram, silently discarded per §6
            Err(e) => (record.on_err)(e),
        }
    }
}

/// Waits for either the socket or the cancellation pipe to become
/// readable. Returns `Ok(true)` when cancellation was observed.
fn poll_wait(fd: RawFd, cancel_fd: RawFd) -> io::Result<bool> {
    let mut fds = [
        libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: cancel_fd,
            events: libc::POLLIN,
            revents: 0,
        },
    ];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(fds[1].revents & libc::POLLIN != 0)
}

/// `lc_msg_recv`: peeks the datagram size, receives header + payload, and
/// applies the interface-scoped and software-join-set filters (§4.3,
/// §4.4). Returns `Ok(None)` for a datagram that should be silently
/// dropped and the loop retried.
fn receive_one(ctx: &Context, sock_idx: usize, fd: RawFd) -> crate::error::Result<Option<Message>> {
    let ifx = ctx
        .with_socket(sock_idx, |s| s.ifx.load(std::sync::atomic::Ordering::SeqCst))
        .unwrap_or(0);
    let sock_id = ctx.with_socket(sock_idx, |s| s.id).unwrap_or(0);

    loop {
        let peeked = sys::peek_len(fd).map_err(|_| Error::last_os_error())?;
        if peeked < HEADER_LEN {
            // Still sitting unread on the socket: a peek never dequeues.
            // Drain it before giving up, or the next iteration peeks the
            // same short datagram forever.
            sys::discard_datagram(fd).map_err(|_| Error::last_os_error())?;
            return Ok(None);
        }
        let mut header_buf = [0u8; HEADER_LEN];
        let mut payload_buf = vec![0u8; peeked - HEADER_LEN];
        let recv = sys::recvmsg_with_pktinfo(fd, &mut header_buf, &mut payload_buf)
            .map_err(|_| Error::last_os_error())?;
        if recv.bytes < HEADER_LEN {
            continue;
        }

        if ifx != 0 {
            match recv.pktinfo_ifindex {
                Some(got) if got == ifx => {}
                _ => continue,
            }
        }

        let dst = match recv.dst {
            Some(d) => d,
            None => continue,
        };

        let accepted = ctx
            .with_socket(sock_idx, |s| s.accepts(dst))
            .unwrap_or(false);
        if !accepted {
            continue;
        }

        let header = Header::decode(&header_buf);
        let payload_len = (header.len as usize).min(payload_buf.len());
        payload_buf.truncate(payload_len);

        return Ok(Some(Message {
            data: payload_buf,
            op: Opcode::from_wire(header.op),
            seq: header.seq,
            nonce: header.nonce,
            timestamp: header.timestamp,
            src: Some(recv.src),
            dst: Some(dst),
            sock_id,
            chan_id: None,
        }));
    }
}

/// `process_msg` + the `lc_op_handler` dispatch table (§4.5).
fn dispatch(ctx: &Context, record: &CallRecord, mut msg: Message) {
    let dst = msg.dst_addr().unwrap_or(Ipv6Addr::UNSPECIFIED);
    let found: Option<Channel> = channel::find_by_group(ctx, dst);

    if let Some(chan) = &found {
        msg.chan_id = Some(chan.id());
        if let Some(seq) = chan.advance_seq(msg.seq(), msg.nonce()) {
            trace!(
                sock_id = record.sock_id,
                chan_id = chan.id(),
                seq,
                "channel sequence advanced"
            );
        }
    }

    match msg.opcode() {
        Opcode::Ping => {
            if let Some(chan) = &found {
                let mut reply = msg.clone();
                reply.set_opcode(Opcode::Pong);
                if let Err(e) = chan.send(&reply) {
                    warn!(sock_id = record.sock_id, error = %e, "failed to reply to PING");
                }
            }
            // The reference implementation mutates the in-flight message's
            // opcode in place before handing it to the callback; this
            // rewrite keeps that behaviour so observers see the same
            // PONG-labelled message the original library delivers.
            msg.set_opcode(Opcode::Pong);
        }
        Opcode::Data | Opcode::Pong | Opcode::Unknown(_) => {}
    }

    (record.on_msg)(msg);
}

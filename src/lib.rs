//! Group communication over IPv6 multicast.
//!
//! Applications create named logical channels, each mapped deterministically
//! to an IPv6 multicast group address; send messages on a channel; and
//! receive messages addressed to any channel joined on a given socket.
//!
//! ```no_run
//! use librecast6::{Channel, Context, Message, Opcode, Socket};
//!
//! # fn main() -> librecast6::Result<()> {
//! let ctx = Context::new();
//! let sock = Socket::new(&ctx)?;
//! let chan = Channel::new(&ctx, "example.channel")?;
//! chan.bind(&sock)?;
//! chan.join()?;
//! sock.listen(
//!     |msg| println!("received {} bytes, op={:?}", msg.data().len(), msg.opcode()),
//!     |err| eprintln!("listener error: {err}"),
//! )?;
//! chan.send(&Message::with_data(b"hello".to_vec(), Opcode::Data))?;
//! sock.listen_cancel()?;
//! # Ok(())
//! # }
//! ```

mod arena;
mod channel;
mod context;
mod error;
mod hash;
mod ids;
mod listener;
mod message;
mod socket;
mod sys;

pub use channel::{Channel, DEFAULT_BASE_ADDR, DEFAULT_PORT};
pub use context::Context;
pub use error::{Error, Result};
pub use message::{Message, Opcode, HEADER_LEN};
pub use socket::{Socket, DEFAULT_MULTICAST_HOPS, DEFAULT_MULTICAST_LOOP};

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recv_with_timeout<T>(rx: &std::sync::mpsc::Receiver<T>, dur: Duration) -> Option<T> {
        rx.recv_timeout(dur).ok()
    }

    #[test]
    fn name_determinism_matches_hash_derivation() {
        let ctx = Context::new();
        let chan = Channel::new(&ctx, "hello").unwrap();
        let digest = crate::hash::hash16(&{
            let mut v = b"hello".to_vec();
            v.extend_from_slice(&0u32.to_ne_bytes());
            v
        })
        .unwrap();
        let mut expected = DEFAULT_BASE_ADDR.octets();
        for i in 2..16 {
            expected[i] ^= digest[i];
        }
        assert_eq!(chan.group(), Ipv6Addr::from(expected));
        assert_eq!(&expected[0..2], &[0xff, 0x1e]);
    }

    #[test]
    fn same_name_different_contexts_same_group() {
        let ctx_a = Context::new();
        let ctx_b = Context::new();
        let a = Channel::new(&ctx_a, "shared-topic").unwrap();
        let b = Channel::new(&ctx_b, "shared-topic").unwrap();
        assert_eq!(a.group(), b.group());
    }

    #[test]
    fn sideband_preserves_high_bytes_and_sets_tag() {
        let ctx = Context::new();
        let base = Channel::new(&ctx, "root").unwrap();
        let band: u64 = 0x0102030405060708;
        let derived = Channel::sideband(&base, band).unwrap();
        let base_octets = base.group().octets();
        let derived_octets = derived.group().octets();
        assert_eq!(base_octets[0..8], derived_octets[0..8]);
        assert_eq!(&derived_octets[8..16], &band.to_ne_bytes());
    }

    #[test]
    fn sidehash_preserves_prefix_and_changes_rest() {
        let ctx = Context::new();
        let base = Channel::new(&ctx, "root").unwrap();
        let derived = Channel::sidehash(&base, b"secret-key").unwrap();
        let base_octets = base.group().octets();
        let derived_octets = derived.group().octets();
        assert_eq!(base_octets[0..2], derived_octets[0..2]);
        assert_ne!(base_octets, derived_octets);
    }

    #[test]
    fn bind_accounts_channel_against_socket() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        let chan = Channel::new(&ctx, "bound-channel").unwrap();
        assert_eq!(sock.bound_count(), 0);
        chan.bind(&sock).unwrap();
        assert_eq!(sock.bound_count(), 1);
        assert_eq!(chan.socket_id(), Some(sock.id()));
    }

    #[test]
    fn join_then_join_again_keeps_one_entry() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        let chan = Channel::new(&ctx, "idempotent-join").unwrap();
        chan.bind(&sock).unwrap();
        chan.join().unwrap();
        chan.join().unwrap();
        let count = ctx
            .with_socket(sock.idx(), |s| {
                s.join_set.lock().unwrap().iter().filter(|g| **g == chan.group()).count()
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn leaving_one_channel_does_not_disturb_another() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        let a = Channel::new(&ctx, "software-join-a").unwrap();
        let b = Channel::new(&ctx, "software-join-b").unwrap();
        a.bind(&sock).unwrap();
        b.bind(&sock).unwrap();
        a.join().unwrap();
        b.join().unwrap();
        a.part().unwrap();

        let (has_a, has_b) = ctx
            .with_socket(sock.idx(), |s| {
                let set = s.join_set.lock().unwrap();
                (set.contains(&a.group()), set.contains(&b.group()))
            })
            .unwrap();
        assert!(!has_a);
        assert!(has_b);
    }

    #[test]
    fn single_datagram_echo_round_trips() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        let chan = Channel::new(&ctx, "echo-test-channel").unwrap();
        chan.bind(&sock).unwrap();
        chan.join().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        sock.listen(
            move |msg| {
                let _ = tx.send(msg);
            },
            |_err| {},
        )
        .unwrap();

        chan.send(&Message::with_data(b"x".to_vec(), Opcode::Data)).unwrap();

        let msg = recv_with_timeout(&rx, Duration::from_secs(2)).expect("message should arrive");
        assert_eq!(msg.data(), b"x");
        assert_eq!(msg.opcode(), Opcode::Data);
        assert_eq!(msg.seq(), 1);
        assert_eq!(msg.dst_addr(), Some(chan.group()));

        sock.listen_cancel().unwrap();
    }

    #[test]
    fn short_datagram_before_header_does_not_wedge_listener() {
        // A datagram shorter than the wire header is only ever `MSG_PEEK`ed
        // while sizing the receive buffer; if it isn't also drained off the
        // socket, the next loop iteration peeks the very same bytes again
        // and the worker spins forever instead of moving on.
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        let chan = Channel::new(&ctx, "short-datagram-channel").unwrap();
        chan.bind(&sock).unwrap();
        chan.join().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        sock.listen(
            move |msg| {
                let _ = tx.send(msg);
            },
            |_err| {},
        )
        .unwrap();

        let raw = std::net::UdpSocket::bind("[::]:0").unwrap();
        raw.send_to(&[0u8; 4], (chan.group(), DEFAULT_PORT)).unwrap();

        chan.send(&Message::with_data(b"after-short".to_vec(), Opcode::Data))
            .unwrap();

        let msg = recv_with_timeout(&rx, Duration::from_secs(2))
            .expect("the real message should still arrive after the short one");
        assert_eq!(msg.data(), b"after-short");

        sock.listen_cancel().unwrap();
    }

    #[test]
    fn ping_receives_exactly_one_pong() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        let chan = Channel::new(&ctx, "ping-test-channel").unwrap();
        chan.bind(&sock).unwrap();
        chan.join().unwrap();

        let seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        sock.listen(
            move |msg| {
                seen2.lock().unwrap().push(msg.clone());
                let _ = tx.send(());
            },
            |_err| {},
        )
        .unwrap();

        chan.send(&Message::with_data(b"p".to_vec(), Opcode::Ping)).unwrap();

        // PING triggers an auto-PONG reply; both the original PING (now
        // relabelled PONG on delivery, matching the reference
        // implementation) and the echoed PONG land on the callback.
        recv_with_timeout(&rx, Duration::from_secs(2)).expect("first message");
        recv_with_timeout(&rx, Duration::from_secs(2)).expect("second message");

        sock.listen_cancel().unwrap();

        let msgs = seen.lock().unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.opcode() == Opcode::Pong));
        assert!(msgs.iter().all(|m| m.data() == b"p"));
    }

    #[test]
    fn sequence_advances_with_max_plus_one_rule() {
        // A receive-side channel's `seq` is advanced by `advance_seq` on
        // every inbound datagram, and a send-side channel's `seq` is
        // advanced by `next_send_seq` on every outbound one. Driving both
        // ends through the *same* `Channel` would race the two: a message
        // dispatched before the next send bumps the shared counter out
        // from under the sender. Use separate contexts, each with its own
        // `ChannelState`, so only the sender's counter feeds the wire
        // sequence this test asserts on.
        let rx_ctx = Context::new();
        let rx_sock = Socket::new(&rx_ctx).unwrap();
        let rx_chan = Channel::new(&rx_ctx, "ordering-test-channel").unwrap();
        rx_chan.bind(&rx_sock).unwrap();
        rx_chan.join().unwrap();

        let tx_ctx = Context::new();
        let tx_sock = Socket::new(&tx_ctx).unwrap();
        let tx_chan = Channel::new(&tx_ctx, "ordering-test-channel").unwrap();
        tx_chan.bind(&tx_sock).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        rx_sock
            .listen(
                move |msg| {
                    let _ = tx.send(msg.seq());
                },
                |_err| {},
            )
            .unwrap();

        const N: u64 = 5;
        for i in 0..N {
            tx_chan.send(&Message::with_data(vec![i as u8], Opcode::Data)).unwrap();
        }

        for k in 1..=N {
            let seq = recv_with_timeout(&rx, Duration::from_secs(2)).expect("message");
            assert_eq!(seq, k);
        }

        rx_sock.listen_cancel().unwrap();
    }

    #[test]
    fn weak_context_does_not_keep_the_last_handle_alive() {
        // The listener worker holds exactly this kind of handle across its
        // blocking wait (`src/listener.rs::run`). A strong clone there
        // would hold `Arc::strong_count` at 2 forever, so the owning
        // `Context`'s `Drop` would never see itself as the sole owner and
        // would never run teardown.
        let ctx = Context::new();
        let weak = ctx.downgrade();
        assert!(weak.upgrade().is_some());
        drop(ctx);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn dropping_every_handle_while_listening_stops_the_worker() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        sock.listen(|_msg| {}, |_err| {}).unwrap();

        // No explicit `listen_cancel`/`close`: the last handles going out
        // of scope must themselves tear the listener down. `Context`'s
        // `Drop` joins the worker thread synchronously as part of
        // teardown, so reaching this point at all (rather than hanging)
        // is the assertion.
        drop(sock);
        drop(ctx);
    }

    #[test]
    fn listen_cancel_is_idempotent() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        sock.listen(|_msg| {}, |_err| {}).unwrap();
        sock.listen_cancel().unwrap();
        // A second cancel with no active worker is a documented no-op.
        sock.listen_cancel().unwrap();
    }

    #[test]
    fn second_listen_call_fails_while_already_listening() {
        let ctx = Context::new();
        let sock = Socket::new(&ctx).unwrap();
        sock.listen(|_msg| {}, |_err| {}).unwrap();
        let err = sock.listen(|_msg| {}, |_err| {}).unwrap_err();
        assert!(matches!(err, Error::AlreadyListening));
        sock.listen_cancel().unwrap();
    }
}

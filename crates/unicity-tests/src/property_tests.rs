//! Property-based tests using proptest.
//!
//! These check invariants of the wire codec, misbehavior scoring and ban
//! bookkeeping over randomly generated inputs.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use unicity_network::codec::{self, decode_header, verify_checksum};
use unicity_network::message::{read_compact_size, write_compact_size};
use unicity_network::misbehavior::DISCOURAGEMENT_THRESHOLD;
use unicity_network::protocol::MAX_SIZE;
use unicity_network::{
    BanList, BanStore, BlockHash, Message, MisbehaviorTracker, NetworkNotifications, PeerId,
    Permissions, Violation,
};

// ============================================================================
// Strategies
// ============================================================================

/// Printable ASCII command names of 1..=12 bytes.
fn arb_command() -> impl Strategy<Value = String> {
    "[a-z]{1,12}"
}

fn arb_violation() -> impl Strategy<Value = Violation> {
    prop_oneof![
        Just(Violation::InvalidPow),
        Just(Violation::OversizedMessage),
        Just(Violation::NonContinuousHeaders),
        Just(Violation::LowWorkHeaders),
        "[a-z ]{0,16}".prop_map(Violation::InvalidHeader),
        Just(Violation::TooManyUnconnecting),
        Just(Violation::TooManyOrphans),
    ]
}

fn arb_known_command() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "version",
        "verack",
        "ping",
        "pong",
        "inv",
        "getheaders",
        "headers",
        "addr",
        "getaddr",
        "sendheaders",
    ])
}

fn peer_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)), 9590)
}

// ============================================================================
// Wire codec
// ============================================================================

proptest! {
    #[test]
    fn prop_frame_header_describes_payload(
        magic in any::<u32>(),
        command in arb_command(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let frame = codec::encode(magic, &command, &payload).unwrap();
        let header = decode_header(&frame).unwrap();
        prop_assert_eq!(header.magic, magic);
        prop_assert_eq!(header.command(), command);
        prop_assert_eq!(header.length as usize, payload.len());
        prop_assert!(verify_checksum(&frame[24..], &header.checksum));
    }

    #[test]
    fn prop_corrupted_payload_fails_checksum(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let frame = codec::encode(0x4B7C_2E91, "ping", &payload).unwrap();
        let header = decode_header(&frame).unwrap();
        let mut corrupted = payload.clone();
        let i = index.index(corrupted.len());
        corrupted[i] ^= flip;
        prop_assert!(!verify_checksum(&corrupted, &header.checksum));
    }

    #[test]
    fn prop_decode_arbitrary_payload_never_panics(
        command in arb_known_command(),
        payload in prop::collection::vec(any::<u8>(), 0..600),
    ) {
        let _ = Message::decode(command, Bytes::from(payload));
    }

    #[test]
    fn prop_decode_header_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..48)) {
        let _ = decode_header(&bytes);
    }

    #[test]
    fn prop_compact_size_uses_minimal_width(n in 0..=MAX_SIZE) {
        let mut buf = BytesMut::new();
        write_compact_size(&mut buf, n);
        let expected = match n {
            0..=0xfc => 1,
            0xfd..=0xffff => 3,
            _ => 5,
        };
        prop_assert_eq!(buf.len(), expected);
        let mut src = buf.freeze();
        prop_assert_eq!(read_compact_size(&mut src).unwrap(), n);
    }

    #[test]
    fn prop_block_hash_display_round_trips(bytes in prop::array::uniform32(any::<u8>())) {
        let hash = BlockHash(bytes);
        prop_assert_eq!(BlockHash::from_hex(&hash.to_string()).unwrap(), hash);
    }
}

// ============================================================================
// Misbehavior scoring
// ============================================================================

proptest! {
    #[test]
    fn prop_score_monotonic_and_flag_sticky(
        violations in prop::collection::vec(arb_violation(), 1..30),
    ) {
        let tracker = MisbehaviorTracker::new(NetworkNotifications::new());
        let peer = PeerId(1);
        tracker.register(peer, peer_addr(), Permissions::NONE);

        let mut last_score = 0;
        let mut flagged = false;
        let mut crossings = 0;
        for violation in violations {
            if tracker.report(peer, violation) {
                crossings += 1;
            }
            let score = tracker.score(peer);
            prop_assert!(score >= last_score);
            last_score = score;

            let now_flagged = tracker.should_disconnect(peer);
            prop_assert!(!flagged || now_flagged);
            prop_assert_eq!(now_flagged, score >= DISCOURAGEMENT_THRESHOLD);
            flagged = now_flagged;
        }
        // The threshold is crossed at most once.
        prop_assert!(crossings <= 1);
    }

    #[test]
    fn prop_no_ban_peer_never_flagged(
        violations in prop::collection::vec(arb_violation(), 1..30),
    ) {
        let tracker = MisbehaviorTracker::new(NetworkNotifications::new());
        let peer = PeerId(2);
        tracker.register(peer, peer_addr(), Permissions::NO_BAN);
        for violation in violations {
            prop_assert!(!tracker.report(peer, violation));
        }
        prop_assert!(!tracker.should_disconnect(peer));
    }

    #[test]
    fn prop_unregistered_peer_ignored(violation in arb_violation()) {
        let tracker = MisbehaviorTracker::new(NetworkNotifications::new());
        prop_assert!(!tracker.report(PeerId(9), violation));
        prop_assert_eq!(tracker.score(PeerId(9)), 0);
        prop_assert!(tracker.is_empty());
    }
}

// ============================================================================
// Ban bookkeeping
// ============================================================================

proptest! {
    #[test]
    fn prop_discouraged_set_bounded(
        ips in prop::collection::vec(any::<[u8; 4]>(), 1..64),
        max in 1usize..16,
    ) {
        let bans = BanList::with_limits(Duration::from_secs(3600), max);
        for octets in &ips {
            bans.discourage(IpAddr::V4(Ipv4Addr::from(*octets)));
            prop_assert!(bans.discouraged_count() <= max);
        }
        let last = ips.last().copied().unwrap_or_default();
        prop_assert!(bans.is_discouraged(&IpAddr::V4(Ipv4Addr::from(last))));
    }
}

//! Property-based tests for Punchline
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

fn v4(ip: u32, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

// ============================================================================
// STUN Codec Properties
// ============================================================================

mod stun_properties {
    use super::*;
    use punchline_nat::StunMessage;
    use punchline_nat::stun::{HEADER_SIZE, MAGIC_COOKIE};

    proptest! {
        /// XOR-MAPPED-ADDRESS recovers the reflected address for any input
        #[test]
        fn xor_mapping_recovers_address(
            ip in any::<u32>(),
            port in any::<u16>(),
            transaction_id in any::<[u8; 12]>(),
        ) {
            let mapped = SocketAddrV4::new(Ipv4Addr::from(ip), port);
            let encoded = StunMessage::binding_response(transaction_id, mapped).encode();

            // XOR-MAPPED-ADDRESS is the first attribute; its port is masked
            let raw_port = u16::from_be_bytes([encoded[HEADER_SIZE + 6], encoded[HEADER_SIZE + 7]]);
            prop_assert_eq!(raw_port, port ^ (MAGIC_COOKIE >> 16) as u16);

            let decoded = StunMessage::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.transaction_id, transaction_id);
            prop_assert_eq!(decoded.mapped_address(), Some(mapped));
        }

        /// Decoding arbitrary bytes never panics
        #[test]
        fn decode_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = StunMessage::decode(&bytes);
        }

        /// Anything shorter than a header is rejected
        #[test]
        fn short_input_rejected(bytes in prop::collection::vec(any::<u8>(), 0..HEADER_SIZE)) {
            prop_assert!(StunMessage::decode(&bytes).is_err());
        }
    }
}

// ============================================================================
// Control Packet Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use punchline_nat::packet::{PACKET_LEN, PACKET_MAGIC};
    use punchline_nat::{ControlPacket, PunchToken};

    proptest! {
        /// Only buffers starting with the magic can decode
        #[test]
        fn decode_requires_magic(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            if ControlPacket::decode(&bytes).is_some() {
                prop_assert!(bytes.len() >= PACKET_LEN);
                prop_assert_eq!(&bytes[..4], &PACKET_MAGIC[..]);
            }
        }

        /// Token hex form is 32 lowercase digits and parses back
        #[test]
        fn token_hex(bytes in any::<[u8; 16]>()) {
            let token = PunchToken::from_bytes(bytes);
            let hex = token.to_hex();
            prop_assert_eq!(hex.len(), 32);
            prop_assert_eq!(PunchToken::from_hex(&hex), Some(token));
        }
    }
}

// ============================================================================
// Classification Properties
// ============================================================================

mod classify_properties {
    use super::*;
    use punchline_nat::{NatType, birthday_candidates, classify};

    proptest! {
        /// A first mapping that keeps the local port is always open
        #[test]
        fn unchanged_port_is_open(
            local_port in 1u16..,
            ip in any::<u32>(),
            second in any::<u16>(),
            third in any::<u16>(),
        ) {
            let mappings = [v4(ip, local_port), v4(ip, second), v4(ip, third)];
            prop_assert_eq!(classify(local_port, &mappings), NatType::Open);
        }

        /// Identical translated mappings are full cone
        #[test]
        fn identical_mappings_are_full_cone(
            local_port in 1u16..,
            ip in any::<u32>(),
            port in 1u16..,
        ) {
            prop_assume!(port != local_port);
            let mapped = v4(ip, port);
            prop_assert_eq!(classify(local_port, &[mapped; 3]), NatType::FullCone);
        }

        /// Primary agreement with a differing secondary is symmetric
        #[test]
        fn secondary_divergence_is_symmetric(
            local_port in 1u16..,
            ip in any::<u32>(),
            port in 1u16..,
            other in 1u16..,
        ) {
            prop_assume!(port != local_port && other != port);
            let mappings = [v4(ip, port), v4(ip, port), v4(ip, other)];
            prop_assert_eq!(classify(local_port, &mappings), NatType::Symmetric);
        }

        /// Classification never yields Unknown for three complete results
        #[test]
        fn complete_results_are_classified(
            local_port in any::<u16>(),
            ports in any::<[u16; 3]>(),
            ip in any::<u32>(),
        ) {
            let mappings = ports.map(|port| v4(ip, port));
            prop_assert_ne!(classify(local_port, &mappings), NatType::Unknown);
        }

        /// Birthday candidates are distinct, nonzero, and at most five
        #[test]
        fn birthday_candidates_are_distinct(reported in any::<u16>(), increment in -20i32..20) {
            let ports = birthday_candidates(reported, increment);
            prop_assert!(ports.len() <= 5);
            prop_assert!(!ports.contains(&0));
            for (i, port) in ports.iter().enumerate() {
                prop_assert!(!ports[i + 1..].contains(port));
            }
        }
    }
}

// ============================================================================
// Strategy Ranking Properties
// ============================================================================

mod strategy_properties {
    use super::*;
    use punchline_core::{ConnectionMethod, get_all_strategies};
    use punchline_nat::NatType;

    fn nat_type() -> impl Strategy<Value = NatType> {
        prop_oneof![
            Just(NatType::Open),
            Just(NatType::FullCone),
            Just(NatType::Symmetric),
            Just(NatType::PortRestricted),
            Just(NatType::Unknown),
        ]
    }

    proptest! {
        /// Strategies come best first and always include both punch methods
        #[test]
        fn ranking_is_sorted(local in nat_type(), remote in nat_type(), relay in any::<bool>()) {
            let strategies = get_all_strategies(local, remote, relay);
            for pair in strategies.windows(2) {
                prop_assert!(
                    pair[0].estimated_success_probability >= pair[1].estimated_success_probability
                );
            }
            let methods: Vec<_> = strategies.iter().map(|s| s.method).collect();
            prop_assert!(methods.contains(&ConnectionMethod::UdpHolePunch));
            prop_assert!(methods.contains(&ConnectionMethod::TcpHolePunch));
            prop_assert_eq!(methods.contains(&ConnectionMethod::TurnRelay), relay);
            for strategy in &strategies {
                prop_assert!((0.0..=1.0).contains(&strategy.estimated_success_probability));
            }
        }

        /// Ranking is symmetric in the two NAT types
        #[test]
        fn ranking_ignores_side(local in nat_type(), remote in nat_type()) {
            let forward = get_all_strategies(local, remote, false);
            let reverse = get_all_strategies(remote, local, false);
            prop_assert_eq!(forward, reverse);
        }
    }
}

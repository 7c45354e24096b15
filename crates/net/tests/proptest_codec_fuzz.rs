//! Decoders must never panic on arbitrary input, and the terrain codec must
//! stay within its error bound.

use proptest::prelude::*;
use simwire_net::message::typed::{PacketAck, TypedMessage};
use simwire_net::terrain::{self, PatchHeights, PATCH_SIZE};
use simwire_net::{frame, zerocode, Listener, MessageRegistry};

/// Patches at an offset anywhere in `±4096` spanning `1e-4..1e3`.
fn heights_strategy() -> impl Strategy<Value = PatchHeights> {
    (
        -4096.0f32..4096.0,
        -4.0f32..3.0,
        prop::collection::vec(0.0f32..=1.0, PATCH_SIZE * PATCH_SIZE),
    )
        .prop_map(|(dc, exponent, samples)| {
            let span = 10f32.powf(exponent);
            let mut h = [[0.0; PATCH_SIZE]; PATCH_SIZE];
            for (i, s) in samples.into_iter().enumerate() {
                h[i / PATCH_SIZE][i % PATCH_SIZE] = dc + span * s;
            }
            h[0][0] = dc;
            h[PATCH_SIZE - 1][PATCH_SIZE - 1] = dc + span;
            h
        })
}

proptest! {
    #[test]
    fn arbitrary_datagrams_dont_panic(
        bytes in prop::collection::vec(any::<u8>(), 0..1500),
    ) {
        let registry = MessageRegistry::standard().unwrap();
        if let Ok(envelope) = frame::parse_envelope(&bytes) {
            let _ = envelope.decode(&registry, Listener::Client, 8192);
            let _ = envelope.decode(&registry, Listener::Peer, 8192);
        }
    }

    #[test]
    fn arbitrary_layer_bodies_dont_panic(
        bytes in prop::collection::vec(any::<u8>(), 0..1200),
    ) {
        let _ = terrain::decode_layer(&bytes, 16);
    }

    #[test]
    fn arbitrary_zerocoded_input_never_panics(
        bytes in prop::collection::vec(any::<u8>(), 0..600),
    ) {
        let _ = zerocode::decode(&bytes, 4096);
    }

    #[test]
    fn zerocode_inverts(bytes in prop::collection::vec(prop_oneof![Just(0u8), any::<u8>()], 0..600)) {
        let packed = zerocode::encode(&bytes);
        prop_assert_eq!(zerocode::decode(&packed, 4096).unwrap(), bytes);
    }

    #[test]
    fn ack_lists_survive_framing(acks in prop::collection::vec(any::<u32>(), 0..40)) {
        let registry = MessageRegistry::standard().unwrap();
        let desc = registry.get(PacketAck::ID).unwrap();
        let message = PacketAck { packets: acks.clone() }.to_message();
        let mut packet = frame::encode_packet(desc, &message, false, 1200).unwrap();
        let appended = frame::append_acks(&mut packet, &acks, 1200);
        prop_assert_eq!(appended, acks.len());

        let envelope = frame::parse_envelope(&packet).unwrap();
        prop_assert_eq!(&envelope.acks, &acks);
        let decoded = envelope.decode(&registry, Listener::Client, 8192).unwrap();
        prop_assert_eq!(PacketAck::try_from(&decoded.message).unwrap().packets, acks);
    }

    #[test]
    fn patch_error_is_bounded(heights in heights_strategy()) {
        let patch = terrain::encode(0, 0, &heights).unwrap();
        let bound = patch.params.error_bound();
        let back = patch.decode().unwrap();
        for (a, b) in heights.iter().flatten().zip(back.iter().flatten()) {
            prop_assert!((a - b).abs() <= bound, "{} vs {} exceeds {}", a, b, bound);
        }
    }

    #[test]
    fn re_encoding_is_a_fixed_point(heights in heights_strategy()) {
        let patch = terrain::encode(5, 6, &heights).unwrap();
        let once = patch.decode().unwrap();
        let again = terrain::encode_with(5, 6, &once, patch.params).unwrap();
        prop_assert_eq!(&again.tokens, &patch.tokens);
        prop_assert_eq!(again.decode().unwrap(), once);
    }
}

#[test]
fn all_zero_patch_is_one_token() {
    let zeros = [[0.0; PATCH_SIZE]; PATCH_SIZE];
    let patch = terrain::encode(0, 0, &zeros).unwrap();
    assert_eq!(patch.tokens, vec![terrain::Token::EndOfBlock]);
    let body = terrain::encode_layer(terrain::LayerType::Land, 256, &[patch]);
    let layer = terrain::decode_layer(&body, 16).unwrap();
    assert_eq!(layer.patches[0].heights, zeros);
}

//! Property-based codec round-trip tests.
//!
//! Uses proptest to verify:
//! 1. Any 32-byte user id survives encode -> decode round-trip.
//! 2. Any announcement payload survives encode -> decode round-trip.
//! 3. Random strings never cause a panic in `decode_user_id`.
//! 4. Random bytes never cause a panic in `decode_payload`.
//! 5. Any blob survives the base64url round-trip.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use gossip_proto::ident::{USER_ID_LEN, UserId, decode_user_id, encode_user_id};
use gossip_proto::payload::{
    AnnouncementPayload, decode_blob, decode_payload, encode_blob, encode_payload,
};

// --- Strategies ---

/// Strategy for generating arbitrary `UserId` values.
fn arb_user_id() -> impl Strategy<Value = UserId> {
    prop::collection::vec(any::<u8>(), USER_ID_LEN)
        .prop_map(|bytes| UserId::from_slice(&bytes).unwrap())
}

/// Strategy for announcement payload fields.
///
/// Names avoid `:` so the legacy split cannot apply; greetings are free-form.
/// Fields are optional, matching the wire format.
fn arb_payload() -> impl Strategy<Value = AnnouncementPayload> {
    (
        prop::option::of("[^:\x00]{1,32}"),
        prop::option::of("[^\x00]{1,256}"),
    )
        .prop_map(|(username, greeting)| AnnouncementPayload { username, greeting })
}

// --- Round-trip laws ---

proptest! {
    #[test]
    fn user_id_round_trip(id in arb_user_id()) {
        let encoded = encode_user_id(&id);
        let decoded = decode_user_id(&encoded).unwrap();
        prop_assert_eq!(id, decoded);
    }

    #[test]
    fn user_id_string_round_trip(id in arb_user_id()) {
        // encode(decode(x)) = x for every valid x.
        let s = encode_user_id(&id);
        let back = encode_user_id(&decode_user_id(&s).unwrap());
        prop_assert_eq!(s, back);
    }

    #[test]
    fn payload_round_trip(payload in arb_payload()) {
        let bytes = encode_payload(&payload).unwrap();
        let decoded = decode_payload(&bytes).unwrap();
        prop_assert_eq!(payload, decoded);
    }

    #[test]
    fn payload_canonical_form_is_json(payload in arb_payload()) {
        let bytes = encode_payload(&payload).unwrap();
        prop_assert!(bytes.first() == Some(&b'{'), "expected JSON object payload");
    }

    #[test]
    fn blob_round_trip(blob in prop::collection::vec(any::<u8>(), 0..512)) {
        let encoded = encode_blob(&blob);
        prop_assert_eq!(decode_blob(&encoded).unwrap(), blob);
    }
}

// --- Graceful-failure laws ---

proptest! {
    #[test]
    fn decode_user_id_never_panics(s in "\\PC{0,128}") {
        let _ = decode_user_id(&s);
    }

    #[test]
    fn decode_payload_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode_payload(&bytes);
    }

    #[test]
    fn decode_blob_never_panics(s in "\\PC{0,128}") {
        let _ = decode_blob(&s);
    }
}

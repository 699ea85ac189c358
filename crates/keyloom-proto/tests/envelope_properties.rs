//! Property-based tests for envelope and message encoding
//!
//! Envelopes are the only values that cross the transport, so decoding must
//! hold up against anything the network hands back.

use keyloom_crypto::KeyId;
use keyloom_proto::{
    DeviceUid, Envelope, EnvelopeBody, IdentityId, InstanceUid, MAX_ENCODED_SIZE, MessageKind,
    ProtocolError, ProtocolId, WireProtocolMessage,
};
use proptest::prelude::*;

fn arbitrary_body() -> impl Strategy<Value = EnvelopeBody> {
    prop_oneof![
        (any::<[u8; 32]>(), prop::collection::vec(any::<u8>(), 0..512)).prop_map(
            |(key_id, ciphertext)| EnvelopeBody::Channel {
                key_id: KeyId::from_bytes(key_id),
                ciphertext,
            }
        ),
        prop::collection::vec(any::<u8>(), 0..512)
            .prop_map(|sealed| EnvelopeBody::Sealed { sealed }),
    ]
}

fn arbitrary_envelope() -> impl Strategy<Value = Envelope> {
    (any::<[[u8; 32]; 4]>(), arbitrary_body()).prop_map(|([a, b, c, d], body)| Envelope {
        from_identity: IdentityId::from_bytes(a),
        from_device: DeviceUid::from_bytes(b),
        to_identity: IdentityId::from_bytes(c),
        to_device: DeviceUid::from_bytes(d),
        body,
    })
}

#[test]
fn prop_envelope_roundtrip() {
    proptest!(|(envelope in arbitrary_envelope())| {
        let bytes = envelope.to_bytes().unwrap();
        prop_assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    });
}

#[test]
fn prop_truncated_envelope_is_rejected() {
    proptest!(|(envelope in arbitrary_envelope(), cut in any::<prop::sample::Index>())| {
        let bytes = envelope.to_bytes().unwrap();
        let truncated = &bytes[..cut.index(bytes.len())];

        // PROPERTY: a strict prefix never decodes
        prop_assert!(matches!(
            Envelope::from_bytes(truncated),
            Err(ProtocolError::CborDecode(_))
        ));
    });
}

#[test]
fn prop_decode_arbitrary_bytes_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..256))| {
        let _ = Envelope::from_bytes(&bytes);
        let _ = WireProtocolMessage::from_bytes(&bytes);
    });
}

#[test]
fn prop_wire_message_keeps_opaque_body() {
    proptest!(|(
        protocol in any::<u16>(),
        kind in any::<u16>(),
        instance in any::<[u8; 32]>(),
        body in prop::collection::vec(any::<u8>(), 0..1024),
    )| {
        let message = WireProtocolMessage {
            protocol: ProtocolId(protocol),
            instance_uid: InstanceUid::from_bytes(instance),
            kind: MessageKind(kind),
            body: body.clone(),
        };

        let decoded = WireProtocolMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(decoded.body, body);
    });
}

#[test]
fn oversized_envelope_is_rejected_on_encode() {
    let envelope = Envelope {
        from_identity: IdentityId::from_bytes([1; 32]),
        from_device: DeviceUid::from_bytes([2; 32]),
        to_identity: IdentityId::from_bytes([3; 32]),
        to_device: DeviceUid::from_bytes([4; 32]),
        body: EnvelopeBody::Sealed { sealed: vec![0; MAX_ENCODED_SIZE] },
    };

    assert!(matches!(envelope.to_bytes(), Err(ProtocolError::TooLarge { .. })));
}

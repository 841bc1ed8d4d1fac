use serde_json::json;
use smp_agent_api::envelope::{
    decode_agent_message, decode_envelope, encode_agent_message, encode_envelope, AgentEnvelope,
    AgentMessage, AgentMsgPayload, PrivHeader,
};
use smp_agent_api::types::{
    ConnectionMode, ConnectionRequest, E2eParams, MsgIntegrity, QueueAddr, QueueId, ServerRef,
    SmpQueueUri, VersionRange,
};
use smp_agent_api::validation::{
    compatible_version, negotiate_versions, AGENT_VERSION_RANGE, SMP_CLIENT_VERSION_RANGE,
};

fn test_server() -> ServerRef {
    ServerRef::new("relay.example.org", 5223, "fp-1")
}

fn test_queue_uri() -> SmpQueueUri {
    SmpQueueUri {
        server: test_server(),
        snd_id: QueueId::new("snd-abc"),
        dh_public: [3u8; 32],
        client_version_range: VersionRange::new(1, 4),
    }
}

#[test]
fn agent_message_roundtrip() {
    let msg = AgentMessage {
        header: PrivHeader {
            snd_msg_id: 7,
            prev_msg_hash: [9u8; 32],
        },
        payload: AgentMsgPayload::Msg {
            body: b"ping".to_vec(),
        },
    };
    let encoded = encode_agent_message(&msg).expect("encode");
    let decoded = decode_agent_message(&encoded).expect("decode");
    assert_eq!(decoded, msg);
}

#[test]
fn rotation_payloads_roundtrip() {
    let payloads = vec![
        AgentMsgPayload::QNew {
            current: QueueAddr {
                server: test_server(),
                snd_id: QueueId::new("snd-old"),
            },
            next_uri: test_queue_uri(),
        },
        AgentMsgPayload::QKeys {
            sender_key: [5u8; 32],
            next_uri: test_queue_uri(),
        },
        AgentMsgPayload::QReady {
            addr: QueueAddr {
                server: test_server(),
                snd_id: QueueId::new("snd-next"),
            },
        },
        AgentMsgPayload::QTest,
        AgentMsgPayload::QHello,
    ];
    for payload in payloads {
        let msg = AgentMessage {
            header: PrivHeader {
                snd_msg_id: 1,
                prev_msg_hash: [0u8; 32],
            },
            payload: payload.clone(),
        };
        let decoded = decode_agent_message(&encode_agent_message(&msg).expect("encode"))
            .expect("decode");
        assert_eq!(decoded.payload, payload);
    }
}

#[test]
fn envelope_rejects_unknown_fields() {
    let envelope = AgentEnvelope::Msg {
        agent_version: 2,
        enc_agent_message: vec![1, 2, 3],
    };
    let mut value = json!(envelope);
    value["Msg"]["unexpected"] = json!(true);
    let bytes = serde_json::to_vec(&value).expect("serialize");
    assert!(decode_envelope(&bytes).is_err());
}

#[test]
fn confirmation_envelope_roundtrip() {
    let envelope = AgentEnvelope::Confirmation {
        agent_version: 2,
        e2e: Some(E2eParams {
            version: 2,
            identity_key: [1u8; 32],
            ratchet_key: [2u8; 32],
        }),
        sender_key: Some([4u8; 32]),
        enc_conn_info: vec![0xAA; 16],
    };
    let decoded = decode_envelope(&encode_envelope(&envelope).expect("encode")).expect("decode");
    assert_eq!(decoded, envelope);
}

#[test]
fn connection_request_uri_roundtrip() {
    let req = ConnectionRequest {
        mode: ConnectionMode::Invitation,
        queue_uri: test_queue_uri(),
        e2e: Some(E2eParams {
            version: 2,
            identity_key: [7u8; 32],
            ratchet_key: [8u8; 32],
        }),
        agent_version_range: AGENT_VERSION_RANGE,
    };
    let uri = req.encode().expect("encode");
    assert!(uri.starts_with("smp-agent://invitation#"));
    let decoded = ConnectionRequest::decode(&uri).expect("decode");
    assert_eq!(decoded, req);
}

#[test]
fn version_negotiation_picks_highest_common() {
    assert_eq!(
        compatible_version(VersionRange::new(1, 3), VersionRange::new(2, 5)),
        Some(3)
    );
    assert_eq!(
        compatible_version(VersionRange::new(1, 1), VersionRange::new(2, 4)),
        None
    );
}

#[test]
fn incompatible_request_is_a_version() {
    let mut req = ConnectionRequest {
        mode: ConnectionMode::Invitation,
        queue_uri: test_queue_uri(),
        e2e: None,
        agent_version_range: VersionRange::new(9, 9),
    };
    let err = negotiate_versions(&req, AGENT_VERSION_RANGE, SMP_CLIENT_VERSION_RANGE).unwrap_err();
    assert_eq!(format!("{err}"), "AGENT A_VERSION");

    req.agent_version_range = AGENT_VERSION_RANGE;
    let negotiated =
        negotiate_versions(&req, AGENT_VERSION_RANGE, SMP_CLIENT_VERSION_RANGE).expect("versions");
    assert_eq!(negotiated.agent_version, 2);
    assert!(negotiated.duplex_handshake());
}

#[test]
fn msg_integrity_serializes_skipped_bounds() {
    let integrity = MsgIntegrity::Skipped {
        from_id: 4,
        to_id: 6,
    };
    let value = json!(integrity);
    assert_eq!(value["Skipped"]["from_id"], 4);
    let decoded: MsgIntegrity = serde_json::from_value(value).expect("decode");
    assert_eq!(decoded, integrity);
}

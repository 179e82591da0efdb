//! Unit tests for the envelope wire form and its error mapping

use serde_json::{Value, json};
use wallet_relay::error::{DELIVERY_FAILED, NO_WALLET, USER_REJECT};
use wallet_relay::{Context, Control, Envelope, ErrorPayload, Frame, MessageType, RelayError, actions};

#[test]
fn test_page_request_parses_from_raw_json() {
    let raw = r#"{
        "type": "REQUEST",
        "action": "GET_BALANCE",
        "data": {"address": "tb1q"},
        "metadata": {"from": "INJECTED", "to": "BACKGROUND", "messageId": "msg_7", "origin": "https://dapp.example"}
    }"#;

    let Frame::Envelope(env) = Frame::from_json(raw).unwrap() else {
        panic!("expected an envelope");
    };
    assert_eq!(env.kind, MessageType::Request);
    assert_eq!(env.action, actions::GET_BALANCE);
    assert_eq!(env.message_id(), Some("msg_7"));
    assert_eq!(env.from(), Some(Context::Injected));
    assert_eq!(env.to(), Some(Context::Background));
    assert!(env.validate().is_ok());
}

#[test]
fn test_missing_data_reads_as_null() {
    let raw = r#"{"type":"EVENT","action":"ENV_CHANGED","metadata":{"from":"BACKGROUND","to":"POPUP"}}"#;
    let Frame::Envelope(env) = Frame::from_json(raw).unwrap() else {
        panic!("expected an envelope");
    };
    assert_eq!(env.data, Value::Null);
    assert!(!env.kind.expects_response());
}

#[test]
fn test_unknown_context_is_rejected() {
    let raw = r#"{"type":"REQUEST","action":"GET_BALANCE","metadata":{"from":"IFRAME","to":"BACKGROUND"}}"#;
    assert!(matches!(Frame::from_json(raw), Err(RelayError::MalformedEnvelope(_))));
}

#[test]
fn test_error_response_wire_form() {
    let request = Envelope::request(actions::SIGN_PSBT, json!({}), Context::Injected, Context::Background)
        .with_message_id("msg_9");
    let reply = request.reply_error(Context::Background, ErrorPayload::user_reject());

    let value = serde_json::to_value(&reply).unwrap();
    assert_eq!(value["type"], "REQUEST");
    assert_eq!(value["error"]["code"], USER_REJECT);
    assert_eq!(value["error"]["message"], "User rejected");
    assert_eq!(value["metadata"]["from"], "BACKGROUND");
    assert_eq!(value["metadata"]["to"], "INJECTED");
    assert_eq!(value["metadata"]["messageId"], "msg_9");
}

#[test]
fn test_remote_codes_survive_the_round_trip() {
    let request = Envelope::request(actions::GET_ACCOUNTS, Value::Null, Context::Injected, Context::Background);

    let err = request
        .reply_error(Context::Background, ErrorPayload::no_wallet())
        .into_result()
        .unwrap_err();
    assert_eq!(err.code(), NO_WALLET);
    assert_eq!(err.to_payload(), ErrorPayload::no_wallet());

    let failed = RelayError::DeliveryFailed {
        link: "CONTENT_BG".to_string(),
        reason: "closed".to_string(),
    };
    let err = request
        .reply_error(Context::Background, failed.to_payload())
        .into_result()
        .unwrap_err();
    assert_eq!(err.code(), DELIVERY_FAILED);
}

#[test]
fn test_control_frames_are_not_envelopes() {
    let ready = Frame::from_json(r#"{"type":"CONNECTION_READY"}"#).unwrap();
    assert_eq!(ready, Frame::Control(Control::ConnectionReady));

    let pong = Frame::from(Control::pong()).to_json().unwrap();
    assert_eq!(pong, r#"{"type":"KEEP_ALIVE","payload":"PONG"}"#);
}

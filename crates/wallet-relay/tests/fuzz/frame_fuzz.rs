//! Fuzz tests for frame decoding and routing decisions
//!
//! Uses proptest to verify that:
//! - Arbitrary input never panics the decoder
//! - Decoded frames re-encode to an equivalent frame
//! - Routing decisions respect addressing and the action registry

use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wallet_relay::router::is_approval_domain;
use wallet_relay::{
    ApprovalBroker, ApprovalGate, ApprovalPolicy, Context, Dispatch, Envelope, Frame, LocalHandler,
    MessageType, Router, actions,
};

fn context_strategy() -> impl Strategy<Value = Context> {
    prop::sample::select(Context::ALL.to_vec())
}

fn kind_strategy() -> impl Strategy<Value = MessageType> {
    prop::sample::select(vec![MessageType::Request, MessageType::Event, MessageType::Approve])
}

fn action_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => prop::sample::select(actions::ALL.to_vec()).prop_map(String::from),
        1 => "[A-Za-z_]{0,24}",
    ]
}

fn envelope_strategy() -> impl Strategy<Value = Envelope> {
    (
        kind_strategy(),
        action_strategy(),
        context_strategy(),
        context_strategy(),
        any::<Option<i64>>(),
        any::<u32>(),
    )
        .prop_map(|(kind, action, from, to, window, n)| {
            let mut env = Envelope::request(action, json!({ "n": n }), from, to)
                .with_message_id(format!("msg_{n}"));
            env.kind = kind;
            match window {
                Some(window) => env.with_window_id(window),
                None => env,
            }
        })
}

fn background_router() -> Router {
    let gate: Arc<dyn LocalHandler> =
        Arc::new(ApprovalGate::new(Arc::new(ApprovalBroker::new()), Duration::from_secs(60)));
    Router::new(Context::Background).with_approvals(gate)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// The decoder never panics on arbitrary text
    #[test]
    fn decode_never_panics(raw in "\\PC*") {
        let _ = Frame::from_json(&raw);
    }

    /// The decoder never panics on arbitrary JSON objects with a type tag
    #[test]
    fn decode_tagged_objects(
        tag in prop::sample::select(vec![
            "REQUEST", "EVENT", "APPROVE", "KEEP_ALIVE", "CONNECTION_CHECK", "CONNECTION_READY", "OTHER",
        ]),
        payload in prop::option::of("[A-Z]{0,6}"),
        action in prop::option::of("[A-Za-z_]{0,12}"),
    ) {
        let mut object = serde_json::Map::new();
        object.insert("type".to_string(), json!(tag));
        if let Some(payload) = payload {
            object.insert("payload".to_string(), json!(payload));
        }
        if let Some(action) = action {
            object.insert("action".to_string(), json!(action));
        }
        let _ = Frame::from_json(&Value::Object(object).to_string());
    }

    /// Encoded envelopes decode to the same envelope
    #[test]
    fn envelope_frames_reencode(env in envelope_strategy()) {
        let frame = Frame::from(env.clone());
        let decoded = Frame::from_json(&frame.to_json().unwrap()).unwrap();
        prop_assert_eq!(decoded, Frame::Envelope(env));
    }

    /// Routing accepts an envelope only when it is well addressed and known
    #[test]
    fn routing_decision_respects_addressing(env in envelope_strategy()) {
        let router = background_router();
        let from = env.from().unwrap();
        let to = env.to().unwrap();
        let known = actions::ALL.contains(&env.action.as_str());

        match router.decide(&env) {
            Err(_) => prop_assert!(from == to || !known || env.action.is_empty()),
            Ok(Dispatch::Forward(target)) => {
                prop_assert_eq!(target, to);
                prop_assert_ne!(to, Context::Background);
            }
            Ok(Dispatch::Approval) => {
                prop_assert_eq!(to, Context::Background);
                prop_assert!(is_approval_domain(&env, &ApprovalPolicy::default()));
            }
            Ok(Dispatch::Local) => {
                prop_assert_eq!(to, Context::Background);
                prop_assert!(!is_approval_domain(&env, &ApprovalPolicy::default()));
            }
        }

        if from != to && known {
            prop_assert!(router.decide(&env).is_ok());
        }
    }

    /// A router without a broker never sends anything to approval
    #[test]
    fn no_broker_no_approval(env in envelope_strategy(), here in context_strategy()) {
        let router = Router::new(here);
        if let Ok(dispatch) = router.decide(&env) {
            prop_assert_ne!(dispatch, Dispatch::Approval);
        }
    }
}

//! Approval broker invariants
//!
//! For any sequence of broker operations:
//! - Every caller is resolved at most once, and only while it is current
//! - The view is visible exactly when a request is pending
//! - Replaced or hidden callers are never resolved

use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;
use wallet_relay::{ApprovalBroker, ApprovalHandle, ApprovalRequest, RelayError};

#[derive(Debug, Clone)]
enum Op {
    Show,
    Confirm(u8),
    Reject,
    Dismiss,
    Hide,
    ExpireLatest,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Show),
        2 => any::<u8>().prop_map(Op::Confirm),
        1 => Just(Op::Reject),
        1 => Just(Op::Dismiss),
        1 => Just(Op::Hide),
        1 => Just(Op::ExpireLatest),
    ]
}

#[derive(Debug, Clone, PartialEq)]
enum Expected {
    Pending,
    Confirmed(u8),
    Rejected,
    Expired,
}

fn settle(handles: Vec<ApprovalHandle>) -> Vec<Option<Result<serde_json::Value, RelayError>>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    runtime.block_on(async move {
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(tokio::time::timeout(Duration::from_secs(1), handle.wait()).await.ok());
        }
        outcomes
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn approvals_resolve_at_most_once(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let broker = ApprovalBroker::new();
        let mut handles = Vec::new();
        let mut ids: Vec<String> = Vec::new();
        let mut expected: Vec<Expected> = Vec::new();
        let mut current: Option<usize> = None;

        for op in ops {
            match op {
                Op::Show => {
                    let handle = broker.show(ApprovalRequest::new("SIGN_PSBT", json!({})));
                    ids.push(handle.id().to_string());
                    handles.push(handle);
                    expected.push(Expected::Pending);
                    current = Some(expected.len() - 1);
                }
                Op::Confirm(n) => {
                    let resolved = broker.confirm(json!(n));
                    prop_assert_eq!(resolved, current.is_some());
                    if let Some(idx) = current.take() {
                        expected[idx] = Expected::Confirmed(n);
                    }
                }
                Op::Reject | Op::Dismiss => {
                    let resolved = if matches!(op, Op::Reject) {
                        broker.reject(None)
                    } else {
                        broker.dismiss()
                    };
                    prop_assert_eq!(resolved, current.is_some());
                    if let Some(idx) = current.take() {
                        expected[idx] = Expected::Rejected;
                    }
                }
                Op::Hide => {
                    broker.hide();
                    current = None;
                }
                Op::ExpireLatest => {
                    let Some(latest) = ids.last() else {
                        prop_assert!(!broker.expire("approve_none"));
                        continue;
                    };
                    let is_current = current == Some(ids.len() - 1);
                    prop_assert_eq!(broker.expire(latest), is_current);
                    if is_current {
                        expected[ids.len() - 1] = Expected::Expired;
                        current = None;
                    }
                }
            }

            prop_assert_eq!(broker.is_visible(), current.is_some());
            prop_assert_eq!(
                broker.current_request().map(|r| r.id),
                current.map(|idx| ids[idx].clone())
            );
        }

        for (outcome, expected) in settle(handles).into_iter().zip(expected) {
            match expected {
                Expected::Pending => prop_assert!(outcome.is_none()),
                Expected::Confirmed(n) => prop_assert_eq!(outcome, Some(Ok(json!(n)))),
                Expected::Rejected => prop_assert_eq!(outcome, Some(Err(RelayError::UserRejected))),
                Expected::Expired => prop_assert!(matches!(outcome, Some(Err(RelayError::ApprovalExpired(_))))),
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_latest_show_wins() {
    let broker = ApprovalBroker::new();
    let first = broker.show(ApprovalRequest::new("SIGN_PSBT", json!(1)));
    let second = broker.show(ApprovalRequest::new("SIGN_MESSAGE", json!(2)));

    let view = broker.view();
    assert!(view.is_visible);
    assert_eq!(view.current_request.unwrap().id, second.id());

    assert!(broker.reject(None));
    assert!(!broker.confirm(json!(null)));
    assert_eq!(second.wait().await, Err(RelayError::UserRejected));
    assert!(
        tokio::time::timeout(Duration::from_secs(600), first.wait())
            .await
            .is_err()
    );
}

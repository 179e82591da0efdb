//! Integration tests for the page-to-background relay
//!
//! These tests wire the four contexts in-process and verify:
//! - FIFO delivery along one path
//! - Correlation of concurrent requests
//! - The approval flow from page call to human answer
//! - Error responses for undeliverable requests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use wallet_relay::error::{DELIVERY_FAILED, USER_REJECT};
use tokio::sync::mpsc;
use wallet_relay::error::INVALID_REQUEST;
use wallet_relay::{
    BackgroundNode, BroadcastHub, ChannelAdapter, Connector, ContentNode, Context, Envelope,
    ErrorPayload, Frame, LinkName, MemoryRuntime, PageNode, PopupNode, RelayConfig, RelayError,
    WalletCore, actions,
};

/// Wallet core that echoes its input and records every call in order
#[derive(Default)]
struct RecordingWallet {
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingWallet {
    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WalletCore for RecordingWallet {
    async fn call(&self, action: &str, data: Value) -> Result<Value, ErrorPayload> {
        self.calls.lock().push((action.to_string(), data.clone()));
        Ok(json!({ "action": action, "echo": data }))
    }
}

struct Extension {
    runtime: MemoryRuntime,
    background: Arc<BackgroundNode>,
    _content: ContentNode,
    page: Arc<PageNode>,
    wallet: Arc<RecordingWallet>,
}

fn config() -> RelayConfig {
    RelayConfig::default().without_keep_alive()
}

async fn setup_extension() -> Extension {
    let runtime = MemoryRuntime::new();
    let hub = BroadcastHub::new();
    let wallet = Arc::new(RecordingWallet::default());

    let background = BackgroundNode::start(runtime.clone(), wallet.clone(), &config());
    let content = ContentNode::start(runtime.clone(), &hub, &config()).await;
    let page = Arc::new(PageNode::start(&hub, &config()).await.unwrap());

    Extension {
        runtime,
        background,
        _content: content,
        page,
        wallet,
    }
}

async fn wait_until_visible(background: &BackgroundNode) {
    let mut views = background.broker().subscribe();
    tokio::time::timeout(Duration::from_secs(5), views.wait_for(|v| v.is_visible))
        .await
        .unwrap()
        .unwrap();
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_send_order() {
    let ext = setup_extension().await;

    for n in 0..50 {
        ext.page
            .transport()
            .emit(actions::ENV_CHANGED, json!(n), Context::Background)
            .await
            .unwrap();
    }
    // A request behind the events flushes the path
    ext.page.request(actions::GET_NETWORK, json!("flush")).await.unwrap();

    let seen: Vec<Value> = ext
        .wallet
        .calls()
        .into_iter()
        .filter(|(action, _)| action == actions::ENV_CHANGED)
        .map(|(_, data)| data)
        .collect();
    assert_eq!(seen, (0..50).map(|n| json!(n)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_concurrent_requests_reach_their_callers() {
    let ext = setup_extension().await;

    let callers: Vec<_> = (0..20)
        .map(|n| {
            let page = Arc::clone(&ext.page);
            tokio::spawn(async move { page.request(actions::GET_BALANCE, json!(n)).await })
        })
        .collect();

    for (n, caller) in callers.into_iter().enumerate() {
        let result = caller.await.unwrap().unwrap();
        assert_eq!(result["echo"], json!(n));
    }
    assert_eq!(ext.page.transport().pending_count(), 0);
}

#[tokio::test]
async fn test_events_take_no_pending_slot() {
    let ext = setup_extension().await;
    ext.page
        .transport()
        .emit(actions::ACCOUNTS_CHANGED, json!([]), Context::Background)
        .await
        .unwrap();
    assert_eq!(ext.page.transport().pending_count(), 0);
}

#[tokio::test]
async fn test_request_to_missing_popup_fails_with_delivery_failed() {
    let ext = setup_extension().await;

    let err = ext
        .page
        .transport()
        .request(actions::GET_ACCOUNTS, Value::Null, Context::Popup)
        .await
        .unwrap_err();
    assert_eq!(err.code(), DELIVERY_FAILED);
    match err {
        RelayError::DeliveryFailed { link, reason } => {
            assert_eq!(link, LinkName::BG_POPUP);
            assert_eq!(reason, "no connected peer");
        }
        other => panic!("expected DeliveryFailed, got {other:?}"),
    }
}

// ============================================================================
// Approval Flow
// ============================================================================

#[tokio::test]
async fn test_approval_confirm_resolves_page_caller() {
    let ext = setup_extension().await;

    let caller = {
        let page = Arc::clone(&ext.page);
        tokio::spawn(async move {
            page.request(actions::GET_APPROVE_DATA, json!({ "psbt": "70736274ff" }))
                .await
        })
    };

    wait_until_visible(&ext.background).await;
    let shown = ext.background.broker().current_request().unwrap();
    assert_eq!(shown.action, actions::GET_APPROVE_DATA);
    assert_eq!(shown.data, json!({ "psbt": "70736274ff" }));
    assert!(shown.id.starts_with("approve_"));

    assert!(ext.background.broker().confirm(json!({ "signed": true })));
    assert_eq!(caller.await.unwrap().unwrap(), json!({ "signed": true }));

    // Gated actions never reach the wallet core
    assert!(ext.wallet.calls().is_empty());
    assert!(!ext.background.broker().is_visible());
}

#[tokio::test]
async fn test_approval_reject_reaches_page_as_user_rejected() {
    let ext = setup_extension().await;

    let caller = {
        let page = Arc::clone(&ext.page);
        tokio::spawn(async move { page.request(actions::SIGN_MESSAGE, json!("hello")).await })
    };

    wait_until_visible(&ext.background).await;
    assert!(ext.background.broker().reject(None));

    let err = caller.await.unwrap().unwrap_err();
    assert_eq!(err, RelayError::UserRejected);
    assert_eq!(err.code(), USER_REJECT);
    assert_eq!(err.to_string(), "User rejected");
}

#[tokio::test]
async fn test_popup_answers_through_its_own_link() {
    let ext = setup_extension().await;
    let popup = PopupNode::start(ext.runtime.clone(), &config()).await.unwrap();

    let caller = {
        let page = Arc::clone(&ext.page);
        tokio::spawn(async move { page.request(actions::SEND_BITCOIN, json!({ "amount": 1000 })).await })
    };
    wait_until_visible(&ext.background).await;

    let pending = popup.get_approve_data().await.unwrap().unwrap();
    assert_eq!(pending.data, json!({ "amount": 1000 }));
    assert_eq!(pending.metadata.unwrap().from, Context::Injected);

    assert!(popup.approve(json!({ "txid": "ab" })).await.unwrap());
    assert_eq!(caller.await.unwrap().unwrap(), json!({ "txid": "ab" }));

    // Nothing left to answer
    assert!(popup.get_approve_data().await.unwrap().is_none());
    assert!(!popup.approve(json!({})).await.unwrap());
}

#[tokio::test]
async fn test_dismissed_window_rejects_caller() {
    let ext = setup_extension().await;

    let caller = {
        let page = Arc::clone(&ext.page);
        tokio::spawn(async move { page.request(actions::SIGN_PSBT, json!({})).await })
    };
    wait_until_visible(&ext.background).await;

    assert!(ext.background.broker().dismiss());
    assert_eq!(caller.await.unwrap(), Err(RelayError::UserRejected));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_expires() {
    let runtime = MemoryRuntime::new();
    let hub = BroadcastHub::new();
    let config = config()
        .with_approval_ttl_secs(60)
        .with_response_timeout_ms(120_000);

    let background = BackgroundNode::start(runtime.clone(), Arc::new(RecordingWallet::default()), &config);
    let _content = ContentNode::start(runtime.clone(), &hub, &config).await;
    let page = PageNode::start(&hub, &config).await.unwrap();

    let err = page.request(actions::SIGN_PSBT, json!({})).await.unwrap_err();
    assert!(matches!(err, RelayError::ApprovalExpired(_)));
    assert!(!background.broker().is_visible());
}

// ============================================================================
// Answer Authority
// ============================================================================

#[tokio::test]
async fn test_page_cannot_answer_its_own_approval() {
    let ext = setup_extension().await;

    let caller = {
        let page = Arc::clone(&ext.page);
        tokio::spawn(async move { page.request(actions::SIGN_PSBT, json!({ "psbt": "00" })).await })
    };
    wait_until_visible(&ext.background).await;

    let forged = Envelope::request(
        actions::APPROVE_RESPONSE,
        json!({ "signed": "forged-by-page" }),
        Context::Popup,
        Context::Background,
    )
    .with_message_id("msg_forged");
    ext.page.connection().send(forged).await.unwrap();

    // Same path, so once this is answered the forged envelope has been seen
    ext.page.request(actions::GET_NETWORK, Value::Null).await.unwrap();

    assert!(ext.background.broker().is_visible());
    assert!(!caller.is_finished());

    assert!(ext.background.broker().reject(None));
    assert_eq!(caller.await.unwrap(), Err(RelayError::UserRejected));
}

#[tokio::test]
async fn test_content_link_cannot_answer_approvals() {
    let ext = setup_extension().await;

    let caller = {
        let page = Arc::clone(&ext.page);
        tokio::spawn(async move { page.request(actions::SIGN_MESSAGE, json!("hi")).await })
    };
    wait_until_visible(&ext.background).await;

    // A raw peer on the content link, speaking for the page
    let port = ext.runtime.open(&LinkName::content_bg()).await.unwrap();
    let (tx, mut frames) = mpsc::unbounded_channel();
    port.on_receive(Arc::new(move |frame| {
        let _ = tx.send(frame);
    }));

    let claims_popup = Envelope::request(actions::APPROVE_RESPONSE, json!("forged"), Context::Popup, Context::Background)
        .with_message_id("msg_1");
    let claims_page = Envelope::request(actions::APPROVE_RESPONSE, json!("forged"), Context::Injected, Context::Background)
        .with_message_id("msg_2");
    port.send(Frame::Envelope(claims_popup)).unwrap();
    port.send(Frame::Envelope(claims_page)).unwrap();

    let refusal = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Frame::Envelope(env)) = frames.recv().await {
                return env;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(refusal.message_id(), Some("msg_2"));
    assert_eq!(refusal.error.unwrap().code, INVALID_REQUEST);

    assert!(ext.background.broker().is_visible());
    assert!(!caller.is_finished());
    port.disconnect();
}

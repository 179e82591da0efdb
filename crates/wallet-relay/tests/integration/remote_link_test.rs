//! Integration tests for links carried over the HTTP/WebSocket server
//!
//! A background node is served on an ephemeral port; a content-side
//! connection manager reaches it through `WebSocketConnector` while the
//! approval is answered through `ApprovalClient`. Answers need the
//! server's bearer token.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use wallet_relay::{
    ApprovalClient, BackgroundNode, ClientConfig, ConnectionManager, Connector, Context, LinkName,
    LocalHandler, MemoryRuntime, MessageTransport, RelayConfig, RelayError, RelayServer, Router,
    StaticWallet, WebSocketConnector, actions,
};

const TOKEN: &str = "test-token";

struct RemoteSetup {
    url: String,
    transport: Arc<MessageTransport>,
    manager: Arc<ConnectionManager>,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for RemoteSetup {
    fn drop(&mut self) {
        self.manager.disconnect();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn setup_remote() -> RemoteSetup {
    let config = RelayConfig::default().without_keep_alive().with_api_token(TOKEN);
    let wallet = StaticWallet::new().with_response(actions::GET_NETWORK, json!("testnet"));
    let node = BackgroundNode::start(MemoryRuntime::new(), Arc::new(wallet), &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (stop, stopped) = oneshot::channel::<()>();
    let server = RelayServer::new(node, config.clone());
    tokio::spawn(async move {
        let _ = server
            .serve_with_listener(listener, async {
                let _ = stopped.await;
            })
            .await;
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(WebSocketConnector::new(ClientConfig::new(url.clone())));
    let manager = ConnectionManager::new(LinkName::content_bg(), connector, config.plain_link(), Some(tx));
    let transport = MessageTransport::new(Context::Content, manager.clone(), config.response_timeout());
    let local: Arc<dyn LocalHandler> = transport.clone();
    let router = Arc::new(Router::new(Context::Content).with_local(local));
    tokio::spawn(router.run(rx));

    RemoteSetup {
        url,
        transport,
        manager,
        stop: Some(stop),
    }
}

fn answering_client(url: &str) -> ApprovalClient {
    ApprovalClient::new(ClientConfig::new(url).with_api_token(TOKEN)).unwrap()
}

/// Start a SIGN_MESSAGE call and wait until its approval is shown
async fn pending_sign(remote: &RemoteSetup) -> tokio::task::JoinHandle<Result<Value, RelayError>> {
    let caller = {
        let transport = Arc::clone(&remote.transport);
        tokio::spawn(async move {
            transport
                .request(actions::SIGN_MESSAGE, json!("hello"), Context::Background)
                .await
        })
    };
    let viewer = ApprovalClient::with_url(&remote.url).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !viewer.view().await.unwrap().is_visible {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    caller
}

#[tokio::test]
async fn test_request_over_websocket_link() {
    let remote = setup_remote().await;

    let network = remote
        .transport
        .request(actions::GET_NETWORK, Value::Null, Context::Background)
        .await
        .unwrap();
    assert_eq!(network, json!("testnet"));
    assert!(remote.manager.is_connected());
}

#[tokio::test]
async fn test_health_and_idle_answers() {
    let remote = setup_remote().await;
    let client = answering_client(&remote.url);

    let health = client.health().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["approval_pending"], false);

    assert!(!client.view().await.unwrap().is_visible);
    assert!(!client.confirm(json!({})).await.unwrap());
    assert!(!client.reject(None).await.unwrap());
}

#[tokio::test]
async fn test_approval_answered_over_http() {
    let remote = setup_remote().await;
    let client = answering_client(&remote.url);
    let mut views = client.watch().await.unwrap();

    let caller = {
        let transport = Arc::clone(&remote.transport);
        tokio::spawn(async move {
            transport
                .request(actions::SIGN_MESSAGE, json!("hello"), Context::Background)
                .await
        })
    };

    let shown = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(view) = views.recv().await {
            if view.is_visible {
                return view.current_request;
            }
        }
        None
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(shown.action, actions::SIGN_MESSAGE);
    assert_eq!(shown.data, json!("hello"));

    assert!(client.confirm(json!({ "signature": "3045" })).await.unwrap());
    assert_eq!(caller.await.unwrap().unwrap(), json!({ "signature": "3045" }));
}

#[tokio::test]
async fn test_answers_without_token_are_refused() {
    let remote = setup_remote().await;
    let caller = pending_sign(&remote).await;

    let anonymous = ApprovalClient::with_url(&remote.url).unwrap();
    let wrong = ApprovalClient::new(ClientConfig::new(remote.url.as_str()).with_api_token("guess")).unwrap();
    for client in [&anonymous, &wrong] {
        assert!(client.confirm(json!({ "signature": "forged" })).await.is_err());
        assert!(client.reject(None).await.is_err());
        assert!(client.dismiss().await.is_err());
    }

    // Still pending for the real answer
    assert!(anonymous.view().await.unwrap().is_visible);
    assert!(!caller.is_finished());

    let client = answering_client(&remote.url);
    assert!(client.reject(None).await.unwrap());
    assert_eq!(caller.await.unwrap(), Err(RelayError::UserRejected));
}

#[tokio::test]
async fn test_popup_link_needs_token() {
    let remote = setup_remote().await;

    let anonymous = WebSocketConnector::new(ClientConfig::new(remote.url.as_str()));
    assert!(anonymous.open(&LinkName::bg_popup()).await.is_err());

    let trusted = WebSocketConnector::new(ClientConfig::new(remote.url.as_str()).with_api_token(TOKEN));
    let port = trusted.open(&LinkName::bg_popup()).await.unwrap();
    assert!(port.is_connected());
    port.disconnect();
}

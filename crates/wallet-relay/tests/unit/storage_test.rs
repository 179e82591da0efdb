//! Unit tests for persisted wallet state on the file store

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use wallet_relay::storage::{Network, TranscendingMode};
use wallet_relay::{FileStore, KeyValueStore, RelayError, SessionStatus, WalletStorage};

#[tokio::test]
async fn test_password_expiry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let unlocked_at = Utc::now() - ChronoDuration::minutes(6);
    {
        let storage = WalletStorage::new(Arc::new(FileStore::open(dir.path()).await.unwrap()));
        storage.set_password_at(Some("hunter2"), unlocked_at).await.unwrap();
    }

    let storage = WalletStorage::new(Arc::new(FileStore::open(dir.path()).await.unwrap()));
    assert_eq!(storage.password().await.unwrap().as_deref(), Some("hunter2"));
    assert_eq!(storage.check_session().await.unwrap(), SessionStatus::Expired);
    assert!(storage.password().await.unwrap().is_none());
    assert!(storage.password_time().await.unwrap().is_none());
}

#[tokio::test]
async fn test_custom_password_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let storage = WalletStorage::new(Arc::new(FileStore::open(dir.path()).await.unwrap()))
        .with_password_ttl(Duration::from_secs(30));

    let now = Utc::now();
    storage.set_password_at(Some("pw"), now).await.unwrap();
    assert_eq!(
        storage.check_session_at(now + ChronoDuration::seconds(10)).await.unwrap(),
        SessionStatus::Active { remaining_secs: 20 }
    );
    assert_eq!(
        storage.check_session_at(now + ChronoDuration::seconds(31)).await.unwrap(),
        SessionStatus::Expired
    );
}

#[tokio::test]
async fn test_settings_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    {
        let storage = WalletStorage::new(Arc::new(FileStore::open(dir.path()).await.unwrap()));
        storage.set_network(Network::Testnet).await.unwrap();
        storage.set_transcending_mode(TranscendingMode::Lightning).await.unwrap();
        storage.set_has_wallet(true).await.unwrap();
        storage.bind_referrer("tb1qa", "alice", Some("ff00")).await.unwrap();
    }

    let storage = WalletStorage::new(Arc::new(FileStore::open(dir.path()).await.unwrap()));
    assert_eq!(storage.network().await.unwrap(), Network::Testnet);
    assert_eq!(storage.transcending_mode().await.unwrap(), TranscendingMode::Lightning);
    assert!(storage.has_wallet().await.unwrap());
    assert_eq!(storage.bound_referrer("tb1qa").await.unwrap().as_deref(), Some("alice"));
    assert_eq!(storage.bound_referrer_txid("tb1qa").await.unwrap().as_deref(), Some("ff00"));
}

#[tokio::test]
async fn test_concurrent_writes_keep_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());

    let writers: Vec<_> = (0..16)
        .map(|n| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.set(&format!("k{n}"), n.to_string()).await })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    assert_eq!(store.keys().await.unwrap().len(), 16);
    assert_eq!(store.get("k7").await.unwrap().as_deref(), Some("7"));
}

#[tokio::test]
async fn test_corrupt_file_is_a_storage_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).await.unwrap();
    tokio::fs::write(store.path(), b"not json").await.unwrap();

    assert!(matches!(store.get("anything").await, Err(RelayError::Storage(_))));
}

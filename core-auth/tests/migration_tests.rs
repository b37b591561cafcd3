//! Integration tests for switching the persistence backend at runtime
//!
//! These tests verify:
//! - The user record moves to the new backend and leaves the old one
//! - Changes made by other contexts are observed on the new backend
//! - An unavailable backend is refused without touching the current one
//! - Pending markers stay in their own store
//! - A file backend keeps the user across a restart

mod common;

use bridge_desktop::{FileStorage, OriginStorage, TabSessionStorage};
use bridge_traits::{KeyValueStorage, PersistenceBackend, StorageScope};
use common::*;
use core_auth::record::{self, RecordType};
use core_auth::types::OperationKind;
use core_auth::{Auth, AuthError, AuthErrorCode, AuthState};
use core_runtime::events::{AuthEvent, CoreEvent};
use std::sync::Arc;

async fn signed_in_on_tab(tab: &TabSessionStorage) -> (Auth, Harness) {
    tab.set(
        &keys().user(),
        &record::encode(RecordType::User, &user("u-1")).unwrap(),
    )
    .await
    .unwrap();

    let (collaborators, harness) = collaborators(MockBackend::new());
    let auth = Auth::initialize(
        config(PersistenceBackend::tab_scoped(Arc::new(tab.clone()))),
        collaborators,
    )
    .await
    .unwrap();
    assert_eq!(auth.state(), AuthState::Authenticated);
    (auth, harness)
}

#[tokio::test]
async fn test_user_moves_to_new_backend() {
    let tab = TabSessionStorage::new();
    let origin = OriginStorage::new();
    let (auth, _harness) = signed_in_on_tab(&tab).await;
    let mut events = auth.events().subscribe();

    assert_eq!(auth.persistence().await, StorageScope::TabScoped);
    auth.set_persistence(PersistenceBackend::origin_scoped(Arc::new(origin.context())))
        .await
        .unwrap();

    assert_eq!(auth.persistence().await, StorageScope::OriginScoped);
    assert!(tab.get(&keys().user()).await.unwrap().is_none());
    let moved = origin.context().get(&keys().user()).await.unwrap().unwrap();
    let moved: core_auth::UserRecord = record::decode(&moved, RecordType::User).unwrap();
    assert_eq!(moved.uid.as_str(), "u-1");

    assert_eq!(auth.current_user().unwrap().uid.as_str(), "u-1");
    assert_eq!(
        events.recv().await.unwrap(),
        CoreEvent::Auth(AuthEvent::PersistenceMigrated {
            from: "tab".to_string(),
            to: "origin".to_string(),
        })
    );
}

#[tokio::test]
async fn test_other_contexts_are_observed_after_switch() {
    let tab = TabSessionStorage::new();
    let origin = OriginStorage::new();
    let (auth, _harness) = signed_in_on_tab(&tab).await;

    auth.set_persistence(PersistenceBackend::origin_scoped(Arc::new(origin.context())))
        .await
        .unwrap();

    origin.context().remove(&keys().user()).await.unwrap();

    wait_for(|| auth.state() == AuthState::Unauthenticated).await;
    assert!(auth.current_user().is_none());
}

#[tokio::test]
async fn test_writes_go_to_new_backend() {
    let tab = TabSessionStorage::new();
    let origin = OriginStorage::new();
    let (auth, _harness) = signed_in_on_tab(&tab).await;

    auth.set_persistence(PersistenceBackend::origin_scoped(Arc::new(origin.context())))
        .await
        .unwrap();
    auth.sign_out().await.unwrap();

    assert!(origin.context().get(&keys().user()).await.unwrap().is_none());
    assert!(tab.get(&keys().user()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unavailable_backend_is_refused() {
    let tab = TabSessionStorage::new();
    let (auth, _harness) = signed_in_on_tab(&tab).await;

    let result = auth
        .set_persistence(PersistenceBackend::origin_scoped(Arc::new(UnavailableStorage)))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(
        err,
        AuthError::StorageUnsupported {
            scope: StorageScope::OriginScoped
        }
    ));
    assert_eq!(err.code(), AuthErrorCode::StorageUnsupported);
    assert_eq!(auth.persistence().await, StorageScope::TabScoped);
    assert!(tab.get(&keys().user()).await.unwrap().is_some());
    assert_eq!(auth.state(), AuthState::Authenticated);
}

#[tokio::test]
async fn test_initialize_with_unavailable_backend_fails() {
    let (collaborators, _harness) = collaborators(MockBackend::new());
    let result = Auth::initialize(
        config(PersistenceBackend::origin_scoped(Arc::new(UnavailableStorage))),
        collaborators,
    )
    .await;

    assert!(matches!(
        result,
        Err(AuthError::StorageUnsupported {
            scope: StorageScope::OriginScoped
        })
    ));
}

#[tokio::test]
async fn test_markers_stay_in_their_store() {
    let tab = TabSessionStorage::new();
    let origin = OriginStorage::new();
    let (auth, _harness) = signed_in_on_tab(&tab).await;

    auth.begin_redirect_sign_in(&provider()).await.unwrap();
    auth.set_persistence(PersistenceBackend::origin_scoped(Arc::new(origin.context())))
        .await
        .unwrap();

    let marker = marker_key(OperationKind::Redirect);
    assert!(tab.get(&marker).await.unwrap().is_some());
    assert!(origin.context().get(&marker).await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_backend_keeps_user_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let tab = TabSessionStorage::new();
    let (auth, _harness) = signed_in_on_tab(&tab).await;

    let file = FileStorage::open(&path).await.unwrap();
    auth.set_persistence(PersistenceBackend::origin_scoped(Arc::new(file)))
        .await
        .unwrap();
    auth.shutdown().await;
    drop(auth);

    let (collaborators, _harness) = collaborators(MockBackend::new());
    let restarted = Auth::initialize(
        config(PersistenceBackend::origin_scoped(Arc::new(
            FileStorage::open(&path).await.unwrap(),
        ))),
        collaborators,
    )
    .await
    .unwrap();

    assert_eq!(restarted.state(), AuthState::Authenticated);
    assert_eq!(restarted.current_user().unwrap().uid.as_str(), "u-1");
}

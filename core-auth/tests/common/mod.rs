//! Shared fakes for the core-auth integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, KeyValueStorage, Navigator, PersistenceBackend, PopupLauncher, PopupRequest,
    PopupWindow,
};
use chrono::{Duration as ChronoDuration, Utc};
use core_auth::backend::{
    BackendSignIn, ChallengeToken, ChallengeVerifier, CodeConfirmation, HandoffCompletion,
    IdentityBackend,
};
use core_auth::keys::StorageKeys;
use core_auth::resolver::{CompletionMessage, CompletionStatus};
use core_auth::types::{OperationKind, ProviderLink, SessionCredential, UserId, UserMetadata};
use core_auth::{AuthCollaborators, BackendError, OAuthProvider, UserRecord};
use core_runtime::config::{AuthConfig, DEFAULT_APP_NAME};
use mockall::mock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const API_KEY: &str = "test-key";

mock! {
    pub Backend {}

    #[async_trait]
    impl IdentityBackend for Backend {
        async fn complete_handoff(&self, completion: HandoffCompletion) -> Result<BackendSignIn, BackendError>;
        async fn send_verification_code(&self, target: &str, challenge: ChallengeToken) -> Result<String, BackendError>;
        async fn confirm_verification_code(&self, confirmation: CodeConfirmation) -> Result<BackendSignIn, BackendError>;
    }
}

struct FakeWindow {
    closed: Arc<AtomicBool>,
}

impl PopupWindow for FakeWindow {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens fake windows the test can close like a user would.
#[derive(Default)]
pub struct FakeLauncher {
    blocked: AtomicBool,
    opened: Mutex<Vec<(PopupRequest, Arc<AtomicBool>)>>,
}

impl FakeLauncher {
    pub fn block(&self) {
        self.blocked.store(true, Ordering::SeqCst);
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> PopupRequest {
        self.opened.lock().unwrap()[index].0.clone()
    }

    /// Correlation id of the `index`th popup, taken from its window name.
    pub fn correlation_id(&self, index: usize) -> String {
        self.request(index)
            .name
            .strip_prefix("identity-popup-")
            .unwrap()
            .to_string()
    }

    pub fn close_by_user(&self, index: usize) {
        self.opened.lock().unwrap()[index]
            .1
            .store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.opened.lock().unwrap()[index].1.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PopupLauncher for FakeLauncher {
    async fn open(&self, request: PopupRequest) -> BridgeResult<Option<Box<dyn PopupWindow>>> {
        if self.blocked.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.opened
            .lock()
            .unwrap()
            .push((request, Arc::clone(&closed)));
        Ok(Some(Box::new(FakeWindow { closed })))
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    failing: AtomicBool,
    urls: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    /// `state` parameter of the last requested URL.
    pub fn last_correlation_id(&self) -> String {
        let url = url::Url::parse(self.urls().last().unwrap()).unwrap();
        url.query_pairs()
            .find(|(name, _)| name == "state")
            .map(|(_, value)| value.into_owned())
            .unwrap()
    }
}

#[async_trait]
impl Navigator for RecordingNavigator {
    async fn request_navigation(&self, url: &str) -> BridgeResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::Refused {
                operation: "navigation",
                reason: "blocked by test".to_string(),
            });
        }
        self.urls.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

/// Hands out numbered challenge tokens.
#[derive(Default)]
pub struct FakeVerifier {
    issued: AtomicUsize,
    resets: AtomicUsize,
}

impl FakeVerifier {
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeVerifier for FakeVerifier {
    async fn obtain_token(&self) -> Result<ChallengeToken, BackendError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ChallengeToken::new(format!("token-{}", n)))
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Storage whose every write fails.
pub struct UnavailableStorage;

#[async_trait]
impl KeyValueStorage for UnavailableStorage {
    async fn get(&self, _key: &str) -> BridgeResult<Option<String>> {
        Ok(None)
    }

    async fn set(&self, key: &str, _value: &str) -> BridgeResult<()> {
        Err(BridgeError::QuotaExceeded {
            key: key.to_string(),
        })
    }

    async fn remove(&self, _key: &str) -> BridgeResult<()> {
        Ok(())
    }

    async fn list_keys(&self, _prefix: &str) -> BridgeResult<Vec<String>> {
        Ok(Vec::new())
    }
}

pub struct Harness {
    pub launcher: Arc<FakeLauncher>,
    pub navigator: Arc<RecordingNavigator>,
    pub verifier: Arc<FakeVerifier>,
}

pub fn collaborators(backend: MockBackend) -> (AuthCollaborators, Harness) {
    let launcher = Arc::new(FakeLauncher::default());
    let navigator = Arc::new(RecordingNavigator::default());
    let verifier = Arc::new(FakeVerifier::default());

    let collaborators = AuthCollaborators::new(
        Arc::new(backend),
        launcher.clone(),
        navigator.clone(),
        verifier.clone(),
    );
    (
        collaborators,
        Harness {
            launcher,
            navigator,
            verifier,
        },
    )
}

pub fn config(backend: PersistenceBackend) -> AuthConfig {
    AuthConfig::builder()
        .api_key(API_KEY)
        .user_persistence(backend)
        .storage_poll_interval(Duration::from_millis(20))
        .popup_poll_interval(Duration::from_millis(10))
        .build()
        .unwrap()
}

pub fn keys() -> StorageKeys {
    StorageKeys::new(API_KEY, DEFAULT_APP_NAME)
}

pub fn marker_key(kind: OperationKind) -> String {
    keys().marker(kind)
}

pub fn provider() -> OAuthProvider {
    OAuthProvider::new(
        "google.com",
        "https://accounts.example.com/o/oauth2/auth",
        "client-1",
        "https://app.example.com/__/auth/handler",
    )
    .unwrap()
}

pub fn user(uid: &str) -> UserRecord {
    let now = Utc::now();
    UserRecord {
        uid: UserId::new(uid),
        provider_links: vec![ProviderLink::new("google.com", format!("sub-{}", uid))],
        credential: SessionCredential {
            access_token: format!("access-{}", uid),
            refresh_token: Some(format!("refresh-{}", uid)),
            expires_at: now + ChronoDuration::hours(1),
        },
        metadata: UserMetadata {
            created_at: now,
            last_sign_in_at: now,
        },
        phone_number: None,
    }
}

pub fn sign_in(uid: &str) -> BackendSignIn {
    BackendSignIn {
        user: user(uid),
        credential: None,
        is_new_user: false,
    }
}

pub fn completion(event_id: &str, correlation_id: &str, outcome: CompletionStatus) -> CompletionMessage {
    CompletionMessage {
        event_id: event_id.to_string(),
        correlation_id: correlation_id.to_string(),
        outcome,
        payload: serde_json::json!({ "code": "4/0Ab" }),
    }
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn wait_for<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

//! # Pending-Operation Tracker
//!
//! Durable markers correlating an in-flight operation across an
//! execution-context boundary (a popup window, a full-page reload).
//!
//! - At most one marker per [`OperationKind`]. Beginning a new operation
//!   overwrites the previous marker and signals the previous in-memory
//!   waiter, if any, through its [`PendingTicket`].
//! - [`PendingOperationTracker::consume`] is a read-then-delete under one
//!   lock, so a marker is handed out at most once.
//! - Abandoned markers are never collected; the next operation of the same
//!   kind overwrites them.

use crate::error::Result;
use crate::keys::StorageKeys;
use crate::persistence::PersistenceStore;
use crate::record::{self, RecordType};
use crate::types::{AuthAction, OperationKind, UserId};
use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, instrument, warn};

/// Verification data carried by a `verification` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationMarker {
    /// Opaque id issued by the backend when the code was sent
    pub verification_id: String,
    /// Phone number the code was sent to
    pub target: String,
}

/// Persisted pending operation marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    pub kind: OperationKind,
    pub correlation_id: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub action: AuthAction,
    /// Current user when a link or re-authentication began
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_uid: Option<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationMarker>,
}

/// What the caller knows about an operation when it begins.
#[derive(Debug, Clone, Default)]
pub struct MarkerMetadata {
    pub provider_id: String,
    pub tenant_id: Option<String>,
    pub action: AuthAction,
    pub user_uid: Option<UserId>,
    pub verification: Option<VerificationMarker>,
}

impl MarkerMetadata {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }
}

/// In-memory side of a begun operation.
///
/// Reports superseded once a newer operation of the same kind begins.
#[derive(Debug)]
pub struct PendingTicket {
    pub kind: OperationKind,
    pub correlation_id: String,
    signal: Option<oneshot::Receiver<()>>,
    superseded: bool,
}

impl PendingTicket {
    fn new(kind: OperationKind, correlation_id: &str, signal: oneshot::Receiver<()>) -> Self {
        Self {
            kind,
            correlation_id: correlation_id.to_string(),
            signal: Some(signal),
            superseded: false,
        }
    }

    /// Whether a newer operation of the same kind has begun.
    ///
    /// A consumed or discarded marker does not count as superseded.
    pub fn is_superseded(&mut self) -> bool {
        if let Some(signal) = self.signal.as_mut() {
            match signal.try_recv() {
                Ok(()) => {
                    self.superseded = true;
                    self.signal = None;
                }
                Err(TryRecvError::Closed) => self.signal = None,
                Err(TryRecvError::Empty) => {}
            }
        }
        self.superseded
    }
}

struct LiveTicket {
    correlation_id: String,
    superseded: oneshot::Sender<()>,
}

pub struct PendingOperationTracker {
    store: Arc<PersistenceStore>,
    keys: StorageKeys,
    clock: Arc<dyn Clock>,
    live: Mutex<HashMap<OperationKind, LiveTicket>>,
}

impl PendingOperationTracker {
    pub fn new(store: Arc<PersistenceStore>, keys: StorageKeys, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            keys,
            clock,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a marker for `kind`, superseding any previous one.
    #[instrument(skip(self, metadata), fields(kind = %kind, correlation_id = %correlation_id))]
    pub async fn begin(
        &self,
        kind: OperationKind,
        correlation_id: &str,
        metadata: MarkerMetadata,
    ) -> Result<PendingTicket> {
        let marker = PendingMarker {
            kind,
            correlation_id: correlation_id.to_string(),
            provider_id: metadata.provider_id,
            tenant_id: metadata.tenant_id,
            action: metadata.action,
            user_uid: metadata.user_uid,
            created_at: self.clock.now(),
            verification: metadata.verification,
        };
        let raw = record::encode(RecordType::for_marker(kind), &marker)?;

        let mut live = self.live.lock().await;
        self.store.set(&self.keys.marker(kind), &raw).await?;

        let (sender, receiver) = oneshot::channel();
        let previous = live.insert(
            kind,
            LiveTicket {
                correlation_id: correlation_id.to_string(),
                superseded: sender,
            },
        );
        if let Some(previous) = previous {
            info!(previous = %previous.correlation_id, "Superseding pending operation");
            let _ = previous.superseded.send(());
        }

        debug!("Pending marker written");
        Ok(PendingTicket::new(kind, correlation_id, receiver))
    }

    /// Take the marker of `kind`; a second call returns `None`.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn consume(&self, kind: OperationKind) -> Result<Option<PendingMarker>> {
        let mut live = self.live.lock().await;
        let marker = self.read(kind).await?;
        if marker.is_none() {
            return Ok(None);
        }

        self.store.remove(&self.keys.marker(kind)).await?;
        live.remove(&kind);

        debug!("Pending marker consumed");
        Ok(marker)
    }

    /// Take the marker of `kind` only if it belongs to `correlation_id`.
    ///
    /// A marker written by a newer operation is left in place.
    pub async fn consume_if(
        &self,
        kind: OperationKind,
        correlation_id: &str,
    ) -> Result<Option<PendingMarker>> {
        let mut live = self.live.lock().await;
        let marker = match self.read(kind).await? {
            Some(marker) if marker.correlation_id == correlation_id => marker,
            Some(_) => {
                debug!(kind = %kind, correlation_id, "Marker belongs to a newer operation, kept");
                return Ok(None);
            }
            None => return Ok(None),
        };

        self.store.remove(&self.keys.marker(kind)).await?;
        if live
            .get(&kind)
            .is_some_and(|ticket| ticket.correlation_id == correlation_id)
        {
            live.remove(&kind);
        }

        debug!(kind = %kind, correlation_id, "Pending marker consumed");
        Ok(Some(marker))
    }

    pub async fn peek(&self, kind: OperationKind) -> Result<Option<PendingMarker>> {
        let _live = self.live.lock().await;
        self.read(kind).await
    }

    /// Drop the marker of `kind` without handing it out.
    pub async fn discard(&self, kind: OperationKind) -> Result<()> {
        let mut live = self.live.lock().await;
        self.store.remove(&self.keys.marker(kind)).await?;
        live.remove(&kind);
        debug!(kind = %kind, "Pending marker discarded");
        Ok(())
    }

    /// Re-attach an in-memory waiter to a marker that survived a reload.
    pub async fn adopt(&self, kind: OperationKind, correlation_id: &str) -> PendingTicket {
        let (sender, receiver) = oneshot::channel();
        let mut live = self.live.lock().await;
        if let Some(previous) = live.insert(
            kind,
            LiveTicket {
                correlation_id: correlation_id.to_string(),
                superseded: sender,
            },
        ) {
            let _ = previous.superseded.send(());
        }

        PendingTicket::new(kind, correlation_id, receiver)
    }

    async fn read(&self, kind: OperationKind) -> Result<Option<PendingMarker>> {
        let Some(raw) = self.store.get(&self.keys.marker(kind)).await? else {
            return Ok(None);
        };

        match record::decode::<PendingMarker>(&raw, RecordType::for_marker(kind)) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                warn!(kind = %kind, error = %e, "Ignoring unreadable pending marker");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{ManualClock, PersistenceBackend, SystemClock};
    use chrono::TimeZone;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn tracker_with_clock(clock: Arc<ManualClock>) -> PendingOperationTracker {
        let store = PersistenceStore::open(PersistenceBackend::volatile())
            .await
            .unwrap();
        PendingOperationTracker::new(Arc::new(store), StorageKeys::new("key", "app"), clock)
    }

    async fn tracker() -> PendingOperationTracker {
        tracker_with_clock(Arc::new(ManualClock::new(epoch()))).await
    }

    #[tokio::test]
    async fn test_consume_returns_marker_once_for_every_kind() {
        let tracker = tracker().await;
        for kind in [
            OperationKind::Popup,
            OperationKind::Redirect,
            OperationKind::Verification,
        ] {
            tracker
                .begin(kind, "cid-1", MarkerMetadata::new("google.com"))
                .await
                .unwrap();

            let marker = tracker.consume(kind).await.unwrap().unwrap();
            assert_eq!(marker.kind, kind);
            assert_eq!(marker.correlation_id, "cid-1");
            assert!(tracker.consume(kind).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_begin_supersedes_previous_operation() {
        let tracker = tracker().await;
        let mut first = tracker
            .begin(OperationKind::Popup, "cid-1", MarkerMetadata::new("google.com"))
            .await
            .unwrap();
        assert!(!first.is_superseded());

        let mut second = tracker
            .begin(OperationKind::Popup, "cid-2", MarkerMetadata::new("github.com"))
            .await
            .unwrap();

        assert!(first.is_superseded());
        assert!(!second.is_superseded());
        let marker = tracker.peek(OperationKind::Popup).await.unwrap().unwrap();
        assert_eq!(marker.correlation_id, "cid-2");
        assert_eq!(marker.provider_id, "github.com");
    }

    #[tokio::test]
    async fn test_kinds_do_not_interfere() {
        let tracker = tracker().await;
        let mut popup = tracker
            .begin(OperationKind::Popup, "cid-1", MarkerMetadata::new("google.com"))
            .await
            .unwrap();
        tracker
            .begin(OperationKind::Redirect, "cid-2", MarkerMetadata::new("google.com"))
            .await
            .unwrap();

        assert!(!popup.is_superseded());
        assert!(tracker.peek(OperationKind::Popup).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_consume_is_not_supersession() {
        let tracker = tracker().await;
        let mut ticket = tracker
            .begin(OperationKind::Redirect, "cid-1", MarkerMetadata::new("google.com"))
            .await
            .unwrap();

        tracker.consume(OperationKind::Redirect).await.unwrap();
        assert!(!ticket.is_superseded());
    }

    #[tokio::test]
    async fn test_consume_if_keeps_newer_marker() {
        let tracker = tracker().await;
        tracker
            .begin(OperationKind::Popup, "cid-2", MarkerMetadata::new("google.com"))
            .await
            .unwrap();

        assert!(tracker
            .consume_if(OperationKind::Popup, "cid-1")
            .await
            .unwrap()
            .is_none());
        assert!(tracker.peek(OperationKind::Popup).await.unwrap().is_some());

        assert!(tracker
            .consume_if(OperationKind::Popup, "cid-2")
            .await
            .unwrap()
            .is_some());
        assert!(tracker.peek(OperationKind::Popup).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_marker_carries_metadata() {
        let tracker = tracker().await;
        let metadata = MarkerMetadata {
            provider_id: "google.com".to_string(),
            tenant_id: Some("tenant-a".to_string()),
            action: AuthAction::Reauthenticate,
            user_uid: Some(UserId::new("u-1")),
            verification: None,
        };
        tracker
            .begin(OperationKind::Redirect, "cid-1", metadata)
            .await
            .unwrap();

        let marker = tracker.consume(OperationKind::Redirect).await.unwrap().unwrap();
        assert_eq!(marker.created_at, epoch());
        assert_eq!(marker.tenant_id.as_deref(), Some("tenant-a"));
        assert_eq!(marker.action, AuthAction::Reauthenticate);
        assert_eq!(marker.user_uid, Some(UserId::new("u-1")));
    }

    #[tokio::test]
    async fn test_unreadable_marker_is_absent() {
        let store = Arc::new(
            PersistenceStore::open(PersistenceBackend::volatile())
                .await
                .unwrap(),
        );
        let keys = StorageKeys::new("key", "app");
        store
            .set(&keys.marker(OperationKind::Redirect), "garbage")
            .await
            .unwrap();
        let tracker = PendingOperationTracker::new(store, keys, Arc::new(SystemClock));

        assert!(tracker
            .consume(OperationKind::Redirect)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_adopt_is_superseded_by_new_begin() {
        let tracker = tracker().await;
        let mut adopted = tracker.adopt(OperationKind::Verification, "vid-1").await;

        tracker
            .begin(OperationKind::Verification, "vid-2", MarkerMetadata::new("phone"))
            .await
            .unwrap();
        assert!(adopted.is_superseded());
    }
}

//! # Auth Configuration Module
//!
//! Provides configuration for the session-persistence and sign-in core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! [`AuthConfig`] holding the persistence backends and tuning values the
//! core runs with. It enforces fail-fast validation: a missing backend or a
//! nonsensical interval is reported from [`AuthConfigBuilder::build`], not
//! discovered later by a background task.
//!
//! ## Required
//!
//! - `api_key` - namespaces every storage key so several instances can share
//!   one origin
//! - `user_persistence` - the backend holding the current user. Selection is
//!   always explicit; there is no auto-detection.
//!
//! ## Optional (with defaults)
//!
//! - `app_name` - instance qualifier (`"[DEFAULT]"`)
//! - `tenant_id` - copied into pending markers
//! - `marker_persistence` - backend for pending markers (same as user)
//! - `storage_poll_interval` - 1000 ms
//! - `popup_poll_interval` - 2000 ms
//! - `popup_close_grace` - 0 ms
//! - `event_buffer_size` - 100
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_traits::PersistenceBackend;
//! use core_runtime::config::AuthConfig;
//! use std::sync::Arc;
//!
//! let config = AuthConfig::builder()
//!     .api_key("AIza-test")
//!     .user_persistence(PersistenceBackend::origin_scoped(Arc::new(my_storage)))
//!     .build()?;
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::AuthConfig;
//!
//! // Panics: no user persistence was selected
//! let config = AuthConfig::builder()
//!     .api_key("AIza-test")
//!     .build()
//!     .expect("Should fail - missing user persistence");
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::PersistenceBackend;
use std::time::Duration;

/// Instance name used when none is configured.
pub const DEFAULT_APP_NAME: &str = "[DEFAULT]";

/// Poll period for backends without native change notification.
pub const DEFAULT_STORAGE_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Poll period of the popup closed-window check.
pub const DEFAULT_POPUP_POLL_INTERVAL: Duration = Duration::from_millis(2000);

const MAX_POPUP_CLOSE_GRACE: Duration = Duration::from_secs(60);

/// Configuration for the auth core.
///
/// Use [`AuthConfigBuilder`] to construct instances.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Application/environment qualifier for storage keys
    pub api_key: String,

    /// Instance qualifier for storage keys
    pub app_name: String,

    /// Tenant recorded on pending markers
    pub tenant_id: Option<String>,

    /// Backend for the current user record
    pub user_persistence: PersistenceBackend,

    /// Backend for pending-operation markers
    pub marker_persistence: PersistenceBackend,

    pub storage_poll_interval: Duration,

    pub popup_poll_interval: Duration,

    /// Delay between seeing a closed popup and settling it as cancelled.
    ///
    /// A completion message arriving inside the grace window still wins.
    pub popup_close_grace: Duration,

    /// Capacity of the library event bus
    pub event_buffer_size: usize,
}

impl AuthConfig {
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::EmptyField { field: "api_key" });
        }

        if self.app_name.trim().is_empty() {
            return Err(Error::EmptyField { field: "app_name" });
        }

        if self.storage_poll_interval.is_zero() {
            return Err(Error::NotPositive {
                field: "storage_poll_interval",
            });
        }

        if self.popup_poll_interval.is_zero() {
            return Err(Error::NotPositive {
                field: "popup_poll_interval",
            });
        }

        if self.popup_close_grace >= MAX_POPUP_CLOSE_GRACE {
            return Err(Error::TooLong {
                field: "popup_close_grace",
                max: MAX_POPUP_CLOSE_GRACE,
                actual: self.popup_close_grace,
            });
        }

        if self.event_buffer_size == 0 {
            return Err(Error::NotPositive {
                field: "event_buffer_size",
            });
        }

        Ok(())
    }
}

fn user_persistence_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "PersistenceBackend".to_string(),
        message: "A user persistence backend must be selected explicitly. \
                 Use PersistenceBackend::volatile() for in-memory sessions, \
                 or inject tab-scoped / origin-scoped storage from the host. \
                 Desktop: enable the 'desktop-shims' feature and use OriginStorage or FileStorage."
            .to_string(),
    }
}

/// Builder for constructing [`AuthConfig`] instances.
#[derive(Debug, Default)]
pub struct AuthConfigBuilder {
    api_key: Option<String>,
    app_name: Option<String>,
    tenant_id: Option<String>,
    user_persistence: Option<PersistenceBackend>,
    marker_persistence: Option<PersistenceBackend>,
    storage_poll_interval: Option<Duration>,
    popup_poll_interval: Option<Duration>,
    popup_close_grace: Option<Duration>,
    event_buffer_size: Option<usize>,
}

impl AuthConfigBuilder {
    /// Sets the application/environment qualifier (required).
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the instance qualifier.
    ///
    /// Default: `"[DEFAULT]"`
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the backend for the current user record (required).
    pub fn user_persistence(mut self, backend: PersistenceBackend) -> Self {
        self.user_persistence = Some(backend);
        self
    }

    /// Sets the backend for pending-operation markers.
    ///
    /// Redirect markers must outlive a reload, so this should be tab-scoped
    /// or origin-scoped whenever redirects are used.
    ///
    /// Default: the user persistence backend
    pub fn marker_persistence(mut self, backend: PersistenceBackend) -> Self {
        self.marker_persistence = Some(backend);
        self
    }

    /// Default: 1000 ms
    pub fn storage_poll_interval(mut self, interval: Duration) -> Self {
        self.storage_poll_interval = Some(interval);
        self
    }

    /// Default: 2000 ms
    pub fn popup_poll_interval(mut self, interval: Duration) -> Self {
        self.popup_poll_interval = Some(interval);
        self
    }

    /// Default: 0 ms (first signal wins)
    pub fn popup_close_grace(mut self, grace: Duration) -> Self {
        self.popup_close_grace = Some(grace);
        self
    }

    /// Default: 100
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Uses one context of a desktop shared origin for both records.
    #[cfg(feature = "desktop-shims")]
    pub fn shared_origin(mut self, origin: &bridge_desktop::OriginStorage) -> Self {
        use std::sync::Arc;

        self.user_persistence = Some(PersistenceBackend::origin_scoped(Arc::new(
            origin.context(),
        )));
        self
    }

    /// Builds the final `AuthConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(AuthConfig)` on success, or an error if:
    /// - The API key or user persistence is missing
    /// - A value is out of range
    pub fn build(self) -> Result<AuthConfig> {
        let api_key = self
            .api_key
            .ok_or(Error::MissingField { field: "api_key" })?;

        let user_persistence = self
            .user_persistence
            .ok_or_else(user_persistence_missing_error)?;

        let marker_persistence = self
            .marker_persistence
            .unwrap_or_else(|| user_persistence.clone());

        let config = AuthConfig {
            api_key,
            app_name: self
                .app_name
                .unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            tenant_id: self.tenant_id,
            user_persistence,
            marker_persistence,
            storage_poll_interval: self
                .storage_poll_interval
                .unwrap_or(DEFAULT_STORAGE_POLL_INTERVAL),
            popup_poll_interval: self
                .popup_poll_interval
                .unwrap_or(DEFAULT_POPUP_POLL_INTERVAL),
            popup_close_grace: self.popup_close_grace.unwrap_or(Duration::ZERO),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::{MemoryStorage, StorageScope};
    use std::sync::Arc;

    fn builder() -> AuthConfigBuilder {
        AuthConfig::builder()
            .api_key("AIza-test")
            .user_persistence(PersistenceBackend::volatile())
    }

    #[test]
    fn test_builder_requires_api_key() {
        let result = AuthConfig::builder()
            .user_persistence(PersistenceBackend::volatile())
            .build();

        assert!(matches!(
            result,
            Err(Error::MissingField { field: "api_key" })
        ));
    }

    #[test]
    fn test_builder_requires_user_persistence() {
        let result = AuthConfig::builder().api_key("AIza-test").build();

        let err = result.unwrap_err();
        assert!(matches!(err, Error::CapabilityMissing { .. }));
        assert!(err.to_string().contains("PersistenceBackend"));
    }

    #[test]
    fn test_builder_defaults() {
        let config = builder().build().unwrap();

        assert_eq!(config.app_name, DEFAULT_APP_NAME);
        assert_eq!(config.tenant_id, None);
        assert_eq!(config.storage_poll_interval, Duration::from_millis(1000));
        assert_eq!(config.popup_poll_interval, Duration::from_millis(2000));
        assert_eq!(config.popup_close_grace, Duration::ZERO);
        assert_eq!(config.event_buffer_size, 100);
        assert_eq!(config.marker_persistence.scope(), StorageScope::Volatile);
    }

    #[test]
    fn test_marker_persistence_defaults_to_user_backend() {
        let storage: Arc<dyn bridge_traits::KeyValueStorage> = Arc::new(MemoryStorage::new());
        let config = AuthConfig::builder()
            .api_key("AIza-test")
            .user_persistence(PersistenceBackend::tab_scoped(storage.clone()))
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(config.marker_persistence.storage(), &storage));
    }

    #[test]
    fn test_validate_rejects_empty_api_key() {
        let result = AuthConfig::builder()
            .api_key("  ")
            .user_persistence(PersistenceBackend::volatile())
            .build();
        assert!(matches!(
            result,
            Err(Error::EmptyField { field: "api_key" })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        assert!(builder()
            .storage_poll_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(builder()
            .popup_poll_interval(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_zero_buffer() {
        assert!(builder().event_buffer_size(0).build().is_err());
    }

    #[test]
    fn test_validate_rejects_long_grace() {
        let err = builder()
            .popup_close_grace(Duration::from_secs(60))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TooLong {
                field: "popup_close_grace",
                ..
            }
        ));
        assert!(builder()
            .popup_close_grace(Duration::from_millis(500))
            .build()
            .is_ok());
    }

    #[cfg(feature = "desktop-shims")]
    #[test]
    fn test_shared_origin_selects_origin_scope() {
        let origin = bridge_desktop::OriginStorage::new();
        let config = AuthConfig::builder()
            .api_key("AIza-test")
            .shared_origin(&origin)
            .build()
            .unwrap();

        assert_eq!(config.user_persistence.scope(), StorageScope::OriginScoped);
    }
}

//! # Host Bridge Traits
//!
//! Capabilities the authentication core requires from its host environment.
//!
//! ## Overview
//!
//! The core never touches browser or OS primitives directly. Each trait in
//! this crate is a narrow capability a host shell implements:
//!
//! ### Storage
//! - [`KeyValueStorage`](storage::KeyValueStorage) - string key/value persistence,
//!   optionally with a native feed of writes made by other execution contexts
//! - [`PersistenceBackend`](storage::PersistenceBackend) - the closed set of
//!   backends (volatile, tab-scoped, origin-scoped) the core is configured with
//!
//! ### Browsing contexts
//! - [`PopupLauncher`](window::PopupLauncher) / [`PopupWindow`](window::PopupWindow) -
//!   secondary windows for the popup handoff
//! - [`Navigator`](window::Navigator) - full-page navigation for the redirect handoff
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - wall-clock source, with [`ManualClock`](time::ManualClock) for tests
//! - [`LoggerSink`](time::LoggerSink) - forward structured logs to host logging
//!
//! ## Fail-Closed Strategy
//!
//! A configured backend that is unavailable in the current environment must
//! surface as an error at construction time rather than silently degrading:
//!
//! ```ignore
//! if !backend.storage().is_available().await {
//!     return Err(AuthError::StorageUnsupported { scope: backend.scope() });
//! }
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! should convert platform errors into it with actionable messages.

pub mod error;
pub mod storage;
pub mod time;
pub mod window;

pub use error::BridgeError;

pub use storage::{
    KeyValueStorage, MemoryStorage, MutationReceiver, PersistenceBackend, StorageMutation,
    StorageScope,
};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
pub use window::{Navigator, PopupLauncher, PopupRequest, PopupWindow};

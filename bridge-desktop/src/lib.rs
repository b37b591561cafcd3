//! # Desktop Bridge Implementations
//!
//! Storage backends for native hosts (macOS, Windows, Linux) and for
//! multi-context tests.
//!
//! ## Overview
//!
//! - [`OriginStorage`] - map shared by every execution context of one origin;
//!   each context handle receives the writes made by its siblings
//! - [`TabSessionStorage`] - map that outlives a single core instance so a
//!   "reload" can pick its entries back up, but is never shared
//! - [`FileStorage`] - JSON file on disk, the durable origin-scoped backend
//!   for a single desktop process
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::OriginStorage;
//! use bridge_traits::PersistenceBackend;
//! use std::sync::Arc;
//!
//! let origin = OriginStorage::new();
//! let tab_a = PersistenceBackend::origin_scoped(Arc::new(origin.context()));
//! let tab_b = PersistenceBackend::origin_scoped(Arc::new(origin.context()));
//! ```

mod file;
mod origin;
mod session;

pub use file::FileStorage;
pub use origin::{ContextId, OriginContext, OriginStorage};
pub use session::TabSessionStorage;

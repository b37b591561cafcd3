//! Browsing-Context Abstractions
//!
//! The identity-provider handoff needs two things from the host: opening a
//! secondary window (popup) and navigating the current context away
//! (redirect). Both are requested by the core and executed by the host.

use async_trait::async_trait;

use crate::error::Result;

/// Default popup geometry, in CSS pixels.
pub const DEFAULT_POPUP_WIDTH: u32 = 500;
pub const DEFAULT_POPUP_HEIGHT: u32 = 600;

/// Parameters for opening a popup window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopupRequest {
    /// Provider URL the window should load
    pub url: String,
    /// Window target name, unique per operation
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl PopupRequest {
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            width: DEFAULT_POPUP_WIDTH,
            height: DEFAULT_POPUP_HEIGHT,
        }
    }
}

/// Handle to an opened popup window.
///
/// `is_closed` is polled; hosts without a close notification only need to
/// report the current state.
pub trait PopupWindow: Send + Sync {
    /// Whether the user (or the host) has closed the window.
    fn is_closed(&self) -> bool;

    /// Close the window. Closing an already closed window is a no-op.
    fn close(&self);

    /// Bring the window to the foreground.
    fn focus(&self) {}
}

/// Opens popup windows.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::window::{PopupLauncher, PopupRequest};
///
/// async fn open(launcher: &dyn PopupLauncher) -> Result<()> {
///     match launcher.open(PopupRequest::new("https://idp.example/auth", "auth-1")).await? {
///         Some(window) => window.focus(),
///         None => println!("blocked"),
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait PopupLauncher: Send + Sync {
    /// Open a window.
    ///
    /// Returns `Ok(None)` when the host (or a popup blocker) refused to open
    /// it.
    async fn open(&self, request: PopupRequest) -> Result<Option<Box<dyn PopupWindow>>>;
}

/// Requests full-page navigation of the current execution context.
///
/// The navigation itself is performed by the host after the call returns;
/// the current context should expect to be torn down.
#[async_trait]
pub trait Navigator: Send + Sync {
    async fn request_navigation(&self, url: &str) -> Result<()>;
}

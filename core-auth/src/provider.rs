//! Identity provider handoff
//!
//! A provider only has to say where to send the user. Everything the
//! completion page needs to route the result back (the correlation id, the
//! mode, the action and the instance qualifiers) travels in the
//! [`HandoffContext`].
//!
//! # Example
//!
//! ```
//! use core_auth::provider::{AuthProvider, HandoffContext, HandoffMode, OAuthProvider};
//! use core_auth::types::AuthAction;
//!
//! let provider = OAuthProvider::new(
//!     "google.com",
//!     "https://accounts.example.com/o/oauth2/auth",
//!     "client-123",
//!     "https://app.example.com/__/auth/handler",
//! )
//! .unwrap()
//! .with_scope("email");
//!
//! let context = HandoffContext {
//!     correlation_id: "abc".to_string(),
//!     mode: HandoffMode::Popup,
//!     action: AuthAction::SignIn,
//!     api_key: "key".to_string(),
//!     app_name: "[DEFAULT]".to_string(),
//!     tenant_id: None,
//! };
//!
//! let url = provider.handoff_url(&context).unwrap();
//! assert!(url.contains("state=abc"));
//! assert!(url.contains("authType=signInViaPopup"));
//! ```

use crate::error::{AuthError, Result};
use crate::types::AuthAction;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use std::fmt;
use url::Url;

/// Query parameters owned by the handoff; custom parameters cannot replace them.
const RESERVED_PARAMETERS: &[&str] = &[
    "client_id",
    "redirect_uri",
    "response_type",
    "scope",
    "state",
    "authType",
    "apiKey",
    "appName",
    "tid",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandoffMode {
    Popup,
    Redirect,
}

impl fmt::Display for HandoffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffMode::Popup => write!(f, "popup"),
            HandoffMode::Redirect => write!(f, "redirect"),
        }
    }
}

/// Everything the provider's completion page needs to route its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffContext {
    pub correlation_id: String,
    pub mode: HandoffMode,
    pub action: AuthAction,
    pub api_key: String,
    pub app_name: String,
    pub tenant_id: Option<String>,
}

impl HandoffContext {
    /// Wire name of the operation, e.g. `signInViaPopup` or `linkViaRedirect`.
    pub fn auth_type(&self) -> String {
        let action = match self.action {
            AuthAction::SignIn => "signIn",
            AuthAction::Link => "link",
            AuthAction::Reauthenticate => "reauth",
        };
        let mode = match self.mode {
            HandoffMode::Popup => "Popup",
            HandoffMode::Redirect => "Redirect",
        };
        format!("{}Via{}", action, mode)
    }
}

/// Builds the URL a user is sent to for one handoff.
pub trait AuthProvider: Send + Sync {
    fn provider_id(&self) -> &str;

    fn handoff_url(&self, context: &HandoffContext) -> Result<String>;
}

/// Generic OAuth authorization-code provider.
#[derive(Debug, Clone)]
pub struct OAuthProvider {
    provider_id: String,
    endpoint: Url,
    client_id: String,
    redirect_uri: String,
    scopes: Vec<String>,
    custom_parameters: Vec<(String, String)>,
}

impl OAuthProvider {
    pub fn new(
        provider_id: impl Into<String>,
        authorization_endpoint: &str,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Result<Self> {
        let provider_id = provider_id.into();
        if provider_id.trim().is_empty() {
            return Err(AuthError::InvalidArgument(
                "provider id must not be empty".to_string(),
            ));
        }

        let endpoint = Url::parse(authorization_endpoint).map_err(|e| {
            AuthError::InvalidArgument(format!("invalid authorization endpoint: {}", e))
        })?;

        Ok(Self {
            provider_id,
            endpoint,
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes: Vec::new(),
            custom_parameters: Vec::new(),
        })
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into();
        if !self.scopes.contains(&scope) {
            self.scopes.push(scope);
        }
        self
    }

    /// Extra query parameter forwarded to the provider.
    ///
    /// Reserved names are ignored.
    pub fn with_custom_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if RESERVED_PARAMETERS.contains(&name.as_str()) {
            tracing::warn!(parameter = %name, "Ignoring reserved custom parameter");
            return self;
        }
        self.custom_parameters.push((name, value.into()));
        self
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

impl AuthProvider for OAuthProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn handoff_url(&self, context: &HandoffContext) -> Result<String> {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("response_type", "code");
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
            query.append_pair("state", &context.correlation_id);
            query.append_pair("authType", &context.auth_type());
            query.append_pair("apiKey", &context.api_key);
            query.append_pair("appName", &context.app_name);
            if let Some(tenant_id) = &context.tenant_id {
                query.append_pair("tid", tenant_id);
            }
            for (name, value) in &self.custom_parameters {
                query.append_pair(name, value);
            }
        }

        tracing::debug!(provider = %self.provider_id, mode = %context.mode, "Built handoff URL");
        Ok(url.to_string())
    }
}

/// Random, URL-safe correlation id for one operation.
pub fn generate_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

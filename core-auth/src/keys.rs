//! Storage key namespace

use crate::types::OperationKind;

pub const KEY_PREFIX: &str = "identity";

/// Keys of one library instance.
///
/// Qualified by api key and app name so several instances can share an
/// origin without colliding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    api_key: String,
    app_name: String,
}

impl StorageKeys {
    pub fn new(api_key: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            app_name: app_name.into(),
        }
    }

    /// Key of the canonical user record.
    pub fn user(&self) -> String {
        format!("{}:authUser:{}:{}", KEY_PREFIX, self.api_key, self.app_name)
    }

    /// Key of the pending marker of `kind`.
    pub fn marker(&self, kind: OperationKind) -> String {
        format!(
            "{}:pending:{}:{}:{}",
            KEY_PREFIX,
            kind.as_str(),
            self.api_key,
            self.app_name
        )
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = StorageKeys::new("AIza", "[DEFAULT]");
        assert_eq!(keys.user(), "identity:authUser:AIza:[DEFAULT]");
        assert_eq!(
            keys.marker(OperationKind::Redirect),
            "identity:pending:redirect:AIza:[DEFAULT]"
        );
    }

    #[test]
    fn test_instances_do_not_collide() {
        let a = StorageKeys::new("AIza", "[DEFAULT]");
        let b = StorageKeys::new("AIza", "secondary");
        assert_ne!(a.user(), b.user());
        assert_ne!(
            a.marker(OperationKind::Popup),
            b.marker(OperationKind::Popup)
        );
    }
}

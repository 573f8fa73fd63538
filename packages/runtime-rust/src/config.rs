use serde::Deserialize;

/// Configuration for a [`ScopeManager`](crate::ScopeManager).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScopeManagerConfig {
    /// Id given to the single global scope.
    pub global_scope_id: String,
    /// Joins session id and application id into a session-application scope id.
    pub session_application_separator: char,
    /// When a thread begins a request while it still holds an un-ended
    /// request scope, destroy the stale scope instead of failing.
    pub replace_stale_request: bool,
    /// Log routine scope begin/end at `info` instead of `debug`.
    pub debug_lifecycle: bool,
}

impl Default for ScopeManagerConfig {
    fn default() -> Self {
        Self {
            global_scope_id: "global".to_string(),
            session_application_separator: '.',
            replace_stale_request: true,
            debug_lifecycle: false,
        }
    }
}

impl ScopeManagerConfig {
    /// Scope id of the session-application scope for the given pair.
    #[must_use]
    pub fn session_application_id(&self, session_id: &str, application_id: &str) -> String {
        format!(
            "{session_id}{}{application_id}",
            self.session_application_separator
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ScopeManagerConfig::default();
        assert_eq!(config.global_scope_id, "global");
        assert_eq!(config.session_application_separator, '.');
        assert!(config.replace_stale_request);
        assert!(!config.debug_lifecycle);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: ScopeManagerConfig =
            serde_json::from_str(r#"{"global_scope_id":"root","debug_lifecycle":true}"#).unwrap();
        assert_eq!(config.global_scope_id, "root");
        assert!(config.debug_lifecycle);
        assert!(config.replace_stale_request);
    }

    #[test]
    fn session_application_id_joins_with_separator() {
        let config = ScopeManagerConfig {
            session_application_separator: '/',
            ..ScopeManagerConfig::default()
        };
        assert_eq!(config.session_application_id("s1", "shop"), "s1/shop");
    }
}

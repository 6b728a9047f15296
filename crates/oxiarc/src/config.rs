//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is fixed when a [`Store`](crate::Store) is created.
//! Defaults suit tests and debugging; [`RuntimeConfig::from_env`] lets a
//! binary adjust them without recompiling:
//!
//! | Variable             | Effect                                         |
//! |----------------------|------------------------------------------------|
//! | `OXIARC_TRACK_EDGES` | `0`/`false`/`off` disables strong edge tracking |
//! | `OXIARC_BACKTRACE`   | `1`/`true`/`on` records allocation sites       |
//! | `OXIARC_LOG`         | log level (`error` .. `trace`)                 |

use oxiarc_log::Level;

/// Environment variable toggling strong edge tracking.
pub const TRACK_EDGES_ENV: &str = "OXIARC_TRACK_EDGES";

/// Environment variable toggling allocation-site backtraces.
pub const BACKTRACE_ENV: &str = "OXIARC_BACKTRACE";

/// Store configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Record an edge for every bound strong handle so that
    /// [`Store::snapshot`](crate::Store::snapshot) can build a heap graph.
    pub track_edges: bool,
    /// Capture a backtrace at every allocation. Only has an effect when the
    /// crate is built with the `alloc_backtrace` feature.
    pub capture_backtraces: bool,
    /// Global log level to install when the store is created.
    pub log_level: Option<Level>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            track_edges: true,
            capture_backtraces: false,
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration from environment variables, falling back to
    /// the defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var(TRACK_EDGES_ENV)
            && let Some(flag) = parse_flag(&value)
        {
            config.track_edges = flag;
        }

        if let Ok(value) = std::env::var(BACKTRACE_ENV)
            && let Some(flag) = parse_flag(&value)
        {
            config.capture_backtraces = flag;
        }

        if let Ok(value) = std::env::var(oxiarc_log::LEVEL_ENV)
            && let Ok(level) = value.parse()
        {
            config.log_level = Some(level);
        }

        config
    }

    /// Enables or disables strong edge tracking.
    #[must_use]
    pub fn with_edge_tracking(mut self, enabled: bool) -> Self {
        self.track_edges = enabled;
        self
    }

    /// Enables or disables allocation-site backtraces.
    #[must_use]
    pub fn with_backtraces(mut self, enabled: bool) -> Self {
        self.capture_backtraces = enabled;
        self
    }

    /// Sets the log level installed by the store.
    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(config.track_edges);
        assert!(!config.capture_backtraces);
        assert_eq!(config.log_level, None);
        assert_eq!(RuntimeConfig::new(), config);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .with_edge_tracking(false)
            .with_backtraces(true)
            .with_log_level(Level::Trace);

        assert!(!config.track_edges);
        assert!(config.capture_backtraces);
        assert_eq!(config.log_level, Some(Level::Trace));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" ON "), Some(true));
        assert_eq!(parse_flag("yes"), Some(true));
        assert_eq!(parse_flag("false"), Some(false));
        assert_eq!(parse_flag("Off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        assert_eq!(parse_flag(""), None);
    }
}

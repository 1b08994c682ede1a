use camino::Utf8Path;
use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::error::FilterError;

/// A rule list as written in the configuration file: groups of patterns.
pub type PatternGroups = Vec<Vec<String>>;

#[derive(Debug, Deserialize, Clone)]
pub struct Cfg {
    pub server: CfgServer,
    #[serde(default)]
    pub log: CfgLog,
    #[serde(default)]
    pub audit: CfgAudit,
    #[serde(default)]
    pub rules: CfgRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgServer {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub max_sessions: Option<usize>,
    pub reload_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgLog {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    pub file: Option<String>,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Fmt,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgAudit {
    #[serde(default = "default_audit_dir")]
    pub dir: String,
}

impl Default for CfgAudit {
    fn default() -> Self {
        CfgAudit {
            dir: default_audit_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CfgRules {
    #[serde(default = "default_reject_code")]
    pub reject_code: u16,
    #[serde(default)]
    pub debug_level: i8,
    #[serde(default)]
    pub whitelist_header: PatternGroups,
    #[serde(default)]
    pub whitelist_body: PatternGroups,
    #[serde(default)]
    pub blacklist_header: PatternGroups,
    #[serde(default)]
    pub blacklist_body: PatternGroups,
}

impl Default for CfgRules {
    fn default() -> Self {
        CfgRules {
            reject_code: default_reject_code(),
            debug_level: 0,
            whitelist_header: Vec::new(),
            whitelist_body: Vec::new(),
            blacklist_header: Vec::new(),
            blacklist_body: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_audit_dir() -> String {
    "/var/tmp/smtp-filter".to_string()
}

fn default_reject_code() -> u16 {
    550
}

impl Cfg {
    pub fn load(cfg_path: &Utf8Path) -> Result<Self, FilterError> {
        let to_error = |source| FilterError::ConfigLoad {
            path: cfg_path.to_string(),
            source,
        };

        let settings = Config::builder()
            .add_source(File::new(cfg_path.as_str(), FileFormat::Toml))
            .build()
            .map_err(to_error)?;

        settings.try_deserialize().map_err(to_error)
    }

    pub fn reload_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.server.reload_interval_secs.unwrap_or(1).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("config.toml")).unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:60025"
upstream_addr = "127.0.0.1:60026"
max_sessions = 20

[log]
level = "debug"
format = "json"

[audit]
dir = "/tmp/audit"

[rules]
reject_code = 450
debug_level = 2
whitelist_body = [['@example\.org', 'mx\.example\.org']]
blacklist_body = [['href=', 'Sunglasses', 'Deal'], ['Bitcoin', 'BTC']]
"#,
        );

        let cfg = Cfg::load(&path).unwrap();
        assert_eq!(cfg.server.listen_addr, "127.0.0.1:60025");
        assert_eq!(cfg.server.max_sessions, Some(20));
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.audit.dir, "/tmp/audit");
        assert_eq!(cfg.rules.reject_code, 450);
        assert_eq!(cfg.rules.debug_level, 2);
        assert_eq!(cfg.rules.blacklist_body.len(), 2);
        assert_eq!(cfg.rules.blacklist_body[0], vec!["href=", "Sunglasses", "Deal"]);
        assert!(cfg.rules.blacklist_header.is_empty());
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:60025"
upstream_addr = "127.0.0.1:60026"
"#,
        );

        let cfg = Cfg::load(&path).unwrap();
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.format, LogFormat::Fmt);
        assert_eq!(cfg.rules.reject_code, 550);
        assert_eq!(cfg.rules.debug_level, 0);
        assert_eq!(cfg.reload_interval(), std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_missing_server_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[rules]\nreject_code = 550\n");
        assert!(matches!(
            Cfg::load(&path),
            Err(FilterError::ConfigLoad { .. })
        ));
    }
}

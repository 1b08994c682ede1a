use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("failed to load configuration from {path}")]
    #[diagnostic(code(smtp_filter::config_load))]
    ConfigLoad {
        path: String,
        #[source]
        source: config::ConfigError,
    },

    #[error("failed to stat configuration file {path}")]
    #[diagnostic(code(smtp_filter::config_stat))]
    ConfigStat {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pattern {pattern:?} in {list} group {group}")]
    #[diagnostic(
        code(smtp_filter::invalid_pattern),
        help("patterns use regex syntax; write raw bytes as \\xNN")
    )]
    InvalidPattern {
        list: &'static str,
        group: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{list} group {group} has no patterns")]
    #[diagnostic(code(smtp_filter::empty_group))]
    EmptyGroup { list: &'static str, group: usize },

    #[error("reject code {0} is not a 4xx or 5xx reply code")]
    #[diagnostic(code(smtp_filter::invalid_reject_code))]
    InvalidRejectCode(u16),

    #[error("session IO error")]
    #[diagnostic(code(smtp_filter::session_io))]
    SessionIo(#[from] std::io::Error),

    #[error("failed to write audit file {path}")]
    #[diagnostic(code(smtp_filter::audit))]
    Audit {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error message followed by its chain of causes.
pub fn error_report(err: &dyn std::error::Error) -> String {
    let mut report = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        report.push_str(": ");
        report.push_str(&cause.to_string());
        source = cause.source();
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_report_includes_causes() {
        let err = FilterError::Audit {
            path: "/tmp/x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(
            error_report(&err),
            "failed to write audit file /tmp/x: disk full"
        );
    }
}

//! Repository server configuration

/// Repository server configuration
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Config {
    /// DSN for the main repository database
    pub primary_db: String,
    /// DSN for the reporting replica (consumed by the external
    /// reporting engine)
    pub reporting_db: String,
    /// Object store bucket for archived records
    pub archive_bucket: String,
    /// Key prefix inside the archive bucket
    pub archive_prefix: String,
    /// Object store bucket for generated reports (external)
    pub report_bucket: String,
    /// base64url-encoded PKCS#8 ECDSA private key; a key is generated
    /// at startup with a warning when unset
    pub signing_key: Option<String>,
    /// Shared secret for the (external) token-issuing endpoint
    pub shared_secret: String,
    /// External event sink name; empty disables forwarding
    pub event_sink: String,
    /// Disable the logical replicator subsystem
    pub disable_replicator: bool,
    /// Disable the report runner subsystem
    pub disable_reporter: bool,
    /// Disable the archiver worker
    pub disable_archiver: bool,
    /// Disable event sink forwarding
    pub disable_eventsink: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            primary_db: std::env::var("PRIMARY_DB").expect("PRIMARY_DB must be set"),
            reporting_db: std::env::var("REPORTING_DB").unwrap_or_default(),
            archive_bucket: std::env::var("ARCHIVE_BUCKET")
                .unwrap_or_else(|_| "docvault-archive".into()),
            archive_prefix: std::env::var("ARCHIVE_PREFIX").unwrap_or_else(|_| "archive".into()),
            report_bucket: std::env::var("REPORT_BUCKET")
                .unwrap_or_else(|_| "docvault-reports".into()),
            signing_key: std::env::var("SIGNING_KEY").ok().filter(|v| !v.is_empty()),
            shared_secret: std::env::var("SHARED_SECRET").unwrap_or_default(),
            event_sink: std::env::var("EVENT_SINK").unwrap_or_default(),
            disable_replicator: flag("DISABLE_REPLICATOR"),
            disable_reporter: flag("DISABLE_REPORTER"),
            disable_archiver: flag("DISABLE_ARCHIVER"),
            disable_eventsink: flag("DISABLE_EVENTSINK"),
        }
    }
}

fn flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        std::env::set_var("DISABLE_ARCHIVER_TEST_FLAG", "true");
        assert!(flag("DISABLE_ARCHIVER_TEST_FLAG"));
        std::env::set_var("DISABLE_ARCHIVER_TEST_FLAG", "0");
        assert!(!flag("DISABLE_ARCHIVER_TEST_FLAG"));
        std::env::remove_var("DISABLE_ARCHIVER_TEST_FLAG");
        assert!(!flag("DISABLE_ARCHIVER_TEST_FLAG"));
    }
}

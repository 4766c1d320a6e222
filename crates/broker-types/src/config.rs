//! Runtime configuration, loaded from the environment the way the rest of
//! this codebase's binaries do (`BROKER_*`, mirroring the `HAVEN_*`
//! convention), with a fail-fast placeholder check for secrets.

use std::time::Duration;

/// Secrets left at one of these well-known placeholder values cause
/// `BrokerConfig::from_env` to abort at startup rather than run insecurely.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "secret",
    "CHANGE_ME",
    "your-secret-here",
    "placeholder",
];

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_host: String,
    pub bind_port: u16,

    pub jwt_secret: String,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    /// Pinned fingerprint(s) endpoints must present; empty disables pinning
    /// (development only).
    pub endpoint_pinned_fingerprints: Vec<String>,

    pub max_sessions_total: usize,
    pub max_sessions_per_endpoint: usize,
    pub max_concurrent_transfers_per_session: usize,

    pub max_file_size: u64,
    pub chunk_size_min: u32,
    pub chunk_size_max: u32,
    pub allowed_extensions: Option<Vec<String>>,
    pub blocked_extensions: Vec<String>,

    pub t_hb: Duration,
    pub t_idle: Duration,
    pub t_stall: Duration,
    pub t_backpressure: Duration,

    pub require_approval_upload: bool,
    pub require_approval_download: bool,
    pub auto_approve_below_bytes: u64,

    pub db_path: String,
    pub temp_dir: String,
}

impl BrokerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let jwt_secret = env_string("BROKER_JWT_SECRET", "")?;
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            anyhow::bail!(
                "BROKER_JWT_SECRET is unset or a placeholder value; refusing to start"
            );
        }

        Ok(Self {
            bind_host: env_string("BROKER_HOST", "0.0.0.0")?,
            bind_port: env_parse("BROKER_PORT", 7443)?,

            jwt_secret,
            tls_cert_path: env_string("BROKER_TLS_CERT", "./certs/broker.crt")?,
            tls_key_path: env_string("BROKER_TLS_KEY", "./certs/broker.key")?,
            endpoint_pinned_fingerprints: env_string("BROKER_ENDPOINT_PINS", "")?
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),

            max_sessions_total: env_parse("BROKER_MAX_SESSIONS_TOTAL", 10_000)?,
            max_sessions_per_endpoint: env_parse("BROKER_MAX_SESSIONS_PER_ENDPOINT", 1)?,
            max_concurrent_transfers_per_session: env_parse(
                "BROKER_MAX_CONCURRENT_TRANSFERS_PER_SESSION",
                4,
            )?,

            max_file_size: env_parse("BROKER_MAX_FILE_SIZE", 10u64 * 1024 * 1024 * 1024)?,
            chunk_size_min: env_parse("BROKER_CHUNK_SIZE_MIN", 16 * 1024)?,
            chunk_size_max: env_parse("BROKER_CHUNK_SIZE_MAX", 1024 * 1024)?,
            allowed_extensions: {
                let raw = env_string("BROKER_ALLOWED_EXTENSIONS", "")?;
                if raw.is_empty() {
                    None
                } else {
                    Some(raw.split(',').map(|s| s.trim().to_lowercase()).collect())
                }
            },
            blocked_extensions: env_string("BROKER_BLOCKED_EXTENSIONS", "exe,bat,cmd,scr,com,msi")?
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),

            t_hb: Duration::from_secs(env_parse("BROKER_T_HB_SECS", 15)?),
            t_idle: Duration::from_secs(env_parse("BROKER_T_IDLE_SECS", 30 * 60)?),
            t_stall: Duration::from_secs(env_parse("BROKER_T_STALL_SECS", 60)?),
            t_backpressure: Duration::from_secs(env_parse("BROKER_T_BACKPRESSURE_SECS", 5)?),

            require_approval_upload: env_parse("BROKER_REQUIRE_APPROVAL_UPLOAD", true)?,
            require_approval_download: env_parse("BROKER_REQUIRE_APPROVAL_DOWNLOAD", true)?,
            auto_approve_below_bytes: env_parse("BROKER_AUTO_APPROVE_BELOW_BYTES", 0)?,

            db_path: env_string("BROKER_DB_PATH", "./broker.sqlite3")?,
            temp_dir: env_string("BROKER_TEMP_DIR", "./tmp")?,
        })
    }
}

fn env_string(key: &str, default: &str) -> anyhow::Result<String> {
    Ok(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        Err(_) => Ok(default),
    }
}

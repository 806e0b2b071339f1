use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Reads a secret, preferring `<KEY>_FILE` (a path to a mounted secrets file)
/// over the plaintext `<KEY>` environment variable. Trims a single trailing
/// newline so secrets written with `echo` round-trip cleanly.
fn read_secret(key: &str) -> Option<String> {
    let file_key = format!("{key}_FILE");
    if let Ok(path) = env::var(&file_key) {
        match std::fs::read_to_string(&path) {
            Ok(contents) => return Some(contents.trim_end_matches('\n').to_string()),
            Err(e) => {
                tracing::warn!(path = %path, error = ?e, "failed to read secret file for {key}, falling back to plain env var");
            }
        }
    }
    env::var(key).ok()
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Per-route rate-limit bucket sizes, expressed as "N requests per window".
#[derive(Debug, Clone, Copy)]
pub struct RateLimitBucket {
    pub requests: u32,
    pub per: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login: RateLimitBucket,
    pub register: RateLimitBucket,
    pub refresh: RateLimitBucket,
    pub messages: RateLimitBucket,
    pub calls: RateLimitBucket,
    pub storage: RateLimitBucket,
    pub default: RateLimitBucket,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let per_minute = |n: u32| RateLimitBucket {
            requests: n,
            per: Duration::from_secs(60),
        };
        RateLimitConfig {
            login: per_minute(5),
            register: per_minute(3),
            refresh: per_minute(10),
            messages: per_minute(100),
            calls: per_minute(20),
            storage: per_minute(30),
            default: per_minute(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: Environment,
    pub database_url: String,
    pub jwt_secret: String,
    pub server_host: String,
    pub server_port: u16,
    pub allowed_origins: Vec<String>,

    pub redis_url: String,

    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_bucket: String,

    pub smtp_host: Option<String>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,

    pub push_provider: String,

    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
    pub turn_user: Option<String>,
    pub turn_password: Option<String>,

    pub request_timeout: Duration,
    pub query_timeout: Duration,
    pub complex_query_timeout: Duration,
    pub object_store_timeout: Duration,
    pub ws_write_timeout: Duration,

    pub ws_max_conns_per_process: usize,
    pub ws_broadcast_buffer: usize,
    pub ws_client_buffer: usize,
    pub mesh_max_participants: usize,

    pub rate_limits: RateLimitConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("JWT_SECRET must be at least 32 bytes in production")]
    WeakJwtSecret,
    #[error("SMTP credentials are required in production")]
    MissingSmtpCredentials,
    #[error("PUSH_PROVIDER=mock is only permitted when ENV=development")]
    MockPushInProduction,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let env = match env::var("ENV").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let jwt_secret = read_secret("JWT_SECRET")
            .unwrap_or_else(|| "dev_secret_change_in_production_min_32_bytes".to_string());

        if env.is_production() && jwt_secret.len() < 32 {
            return Err(ConfigError::WeakJwtSecret);
        }

        let smtp_host = read_secret("SMTP_HOST");
        let smtp_user = read_secret("SMTP_USER");
        let smtp_password = read_secret("SMTP_PASSWORD");
        if env.is_production() && (smtp_host.is_none() || smtp_user.is_none() || smtp_password.is_none()) {
            return Err(ConfigError::MissingSmtpCredentials);
        }

        let push_provider = env_or("PUSH_PROVIDER", "mock");
        if push_provider == "mock" && env.is_production() {
            return Err(ConfigError::MockPushInProduction);
        }

        let allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let split_list = |key: &str| -> Vec<String> {
            env::var(key)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        Ok(Config {
            env,
            database_url,
            jwt_secret,
            server_host: env_or("SERVER_HOST", "127.0.0.1"),
            server_port: env_or("SERVER_PORT", "8080").parse().unwrap_or(8080),
            allowed_origins,

            redis_url: {
                let host = env_or("REDIS_HOST", "127.0.0.1");
                let port = env_or("REDIS_PORT", "6379");
                match read_secret("REDIS_PASSWORD") {
                    Some(pw) if !pw.is_empty() => format!("redis://:{pw}@{host}:{port}"),
                    _ => format!("redis://{host}:{port}"),
                }
            },

            s3_endpoint: env::var("MINIO_ENDPOINT").ok(),
            s3_access_key: read_secret("MINIO_ACCESS_KEY"),
            s3_secret_key: read_secret("MINIO_SECRET_KEY"),
            s3_bucket: env_or("S3_BUCKET", "secureconnect-files"),

            smtp_host,
            smtp_user,
            smtp_password,

            push_provider,

            stun_servers: split_list("WEBRTC_STUN_SERVERS"),
            turn_servers: split_list("WEBRTC_TURN_SERVERS"),
            turn_user: read_secret("TURN_USER"),
            turn_password: read_secret("TURN_PASSWORD"),

            request_timeout: env_duration_secs("REQUEST_TIMEOUT", 30),
            query_timeout: env_duration_secs("QUERY_TIMEOUT", 5),
            complex_query_timeout: env_duration_secs("COMPLEX_QUERY_TIMEOUT", 30),
            object_store_timeout: Duration::from_secs(10),
            ws_write_timeout: Duration::from_secs(10),

            ws_max_conns_per_process: env_usize("WS_MAX_CONNS_PER_PROCESS", 1000),
            ws_broadcast_buffer: env_usize("WS_BROADCAST_BUFFER", 1000),
            ws_client_buffer: env_usize("WS_CLIENT_BUFFER", 1000),
            mesh_max_participants: env_usize("MESH_MAX_PARTICIPANTS", 4),

            rate_limits: RateLimitConfig::default(),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn upload_dir(&self) -> PathBuf {
        PathBuf::from(env_or("UPLOAD_DIR", "./uploads"))
    }
}

//! Service configuration.

use serde::Deserialize;
use std::path::Path;

use consult_core::PricingConfig;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// PostgreSQL connection URL. Takes precedence over `data_dir` when set.
    pub database_url: Option<String>,

    /// Maximum PostgreSQL pool size.
    pub database_max_connections: u32,

    /// Path to `RocksDB` data directory (default: "/data/consult").
    pub data_dir: String,

    /// HS256 secret used to validate user tokens.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience (default: "consult").
    pub auth_audience: String,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Admin API key for operator endpoints.
    pub admin_api_key: Option<String>,

    /// Shared secret the payment collaborator signs webhooks with.
    pub payment_webhook_secret: Option<String>,

    /// Shared secret the voice provider signs call events with.
    pub voice_webhook_secret: Option<String>,

    /// OpenAI-compatible chat API base URL (optional).
    pub ai_api_url: Option<String>,

    /// Chat API key (optional).
    pub ai_api_key: Option<String>,

    /// Chat model name.
    pub ai_model: String,

    /// Voice provider base URL (optional).
    pub voice_api_url: Option<String>,

    /// Voice provider API key (optional).
    pub voice_api_key: Option<String>,

    /// Push collaborator endpoint (optional).
    pub push_url: Option<String>,

    /// Push collaborator API key (optional).
    pub push_api_key: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Seconds a started call may wait for the provider to connect.
    pub call_connect_timeout_seconds: u64,

    /// Connected seconds after which a call is ended (default: 2 hours).
    pub call_max_duration_seconds: u64,

    /// Pricing configuration.
    pub pricing: PricingConfig,
}

/// Chat provider secrets file structure.
#[derive(Debug, Deserialize)]
struct AiSecrets {
    api_url: String,
    api_key: String,
    #[serde(default)]
    model: Option<String>,
}

/// Voice provider secrets file structure.
#[derive(Debug, Deserialize)]
struct VoiceSecrets {
    api_url: String,
    api_key: String,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let (ai_api_url, ai_api_key, ai_model) = load_ai_secrets();
        let (voice_api_url, voice_api_key) = load_voice_secrets();

        let mut pricing = PricingConfig::default();
        if let Some(markup) = env_parse::<f64>("CHAT_MARKUP").filter(|m| *m > 0.0) {
            pricing.chat_markup = markup;
        }

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL").ok(),
            database_max_connections: env_parse("DATABASE_MAX_CONNECTIONS").unwrap_or(10),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "/data/consult".into()),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            auth_audience: std::env::var("AUTH_AUDIENCE").unwrap_or_else(|_| "consult".into()),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            payment_webhook_secret: std::env::var("PAYMENT_WEBHOOK_SECRET").ok(),
            voice_webhook_secret: std::env::var("VOICE_WEBHOOK_SECRET").ok(),
            ai_api_url,
            ai_api_key,
            ai_model: ai_model.unwrap_or_else(|| "gpt-4o-mini".into()),
            voice_api_url,
            voice_api_key,
            push_url: std::env::var("PUSH_URL").ok(),
            push_api_key: std::env::var("PUSH_API_KEY").ok(),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(1024 * 1024), // 1MB
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS").unwrap_or(30),
            call_connect_timeout_seconds: env_parse("CALL_CONNECT_TIMEOUT_SECONDS").unwrap_or(30),
            call_max_duration_seconds: env_parse("CALL_MAX_DURATION_SECONDS")
                .filter(|s| *s > 0)
                .unwrap_or(2 * 60 * 60),
            pricing,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Load chat provider secrets from file or environment.
fn load_ai_secrets() -> (Option<String>, Option<String>, Option<String>) {
    let secret_paths = [".secrets/ai.json", "../.secrets/ai.json"];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<AiSecrets>(path) {
            tracing::info!(path = %path, "Loaded AI provider secrets from file");
            return (Some(secrets.api_url), Some(secrets.api_key), secrets.model);
        }
    }

    tracing::debug!("AI secrets file not found, using environment variables");
    (
        std::env::var("AI_API_URL").ok(),
        std::env::var("AI_API_KEY").ok(),
        std::env::var("AI_MODEL").ok(),
    )
}

/// Load voice provider secrets from file or environment.
fn load_voice_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [".secrets/voice.json", "../.secrets/voice.json"];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<VoiceSecrets>(path) {
            tracing::info!(path = %path, "Loaded voice provider secrets from file");
            return (Some(secrets.api_url), Some(secrets.api_key));
        }
    }

    tracing::debug!("Voice secrets file not found, using environment variables");
    (
        std::env::var("VOICE_API_URL").ok(),
        std::env::var("VOICE_API_KEY").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: None,
            database_max_connections: 10,
            data_dir: "/data/consult".into(),
            auth_jwt_secret: None,
            auth_audience: "consult".into(),
            service_api_key: None,
            admin_api_key: None,
            payment_webhook_secret: None,
            voice_webhook_secret: None,
            ai_api_url: None,
            ai_api_key: None,
            ai_model: "gpt-4o-mini".into(),
            voice_api_url: None,
            voice_api_key: None,
            push_url: None,
            push_api_key: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            call_connect_timeout_seconds: 30,
            call_max_duration_seconds: 2 * 60 * 60,
            pricing: PricingConfig::default(),
        }
    }
}

use anyhow::{Context, Result, bail};
use banking_flow::{
    FlowSettings, SessionTtls,
    credentials::{Argon2Verifier, CompatibleVerifier, CredentialVerifier},
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_LLM_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Longest accepted scratch or login lifetime (30 days)
pub const MAX_TTL_SECS: i64 = 30 * 86_400;
/// Longest accepted idle lifetime for a session record (90 days)
pub const MAX_IDLE_SECS: i64 = 90 * 86_400;

/// How stored account credentials are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// argon2 hashes and legacy plaintext rows
    Compatible,
    /// argon2 hashes only
    Argon2,
}

impl CredentialMode {
    pub fn verifier(self) -> Arc<dyn CredentialVerifier> {
        match self {
            CredentialMode::Compatible => Arc::new(CompatibleVerifier),
            CredentialMode::Argon2 => Arc::new(Argon2Verifier),
        }
    }
}

impl FromStr for CredentialMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "compatible" => Ok(CredentialMode::Compatible),
            "argon2" => Ok(CredentialMode::Argon2),
            other => bail!("unknown CREDENTIAL_MODE '{other}', expected compatible or argon2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("pretty") {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Everything the service reads from its environment, loaded once at startup
#[derive(Clone)]
pub struct ServiceConfig {
    pub port: u16,
    /// Postgres for sessions and banking data; in-memory with demo data when absent
    pub database_url: Option<String>,
    pub openrouter_api_key: String,
    pub llm_model: String,
    /// Replies are only logged when absent
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub telegram_webhook_secret: Option<String>,
    /// Bearer token for `/chat` and `/session`; those routes refuse every call when absent
    pub api_token: Option<String>,
    pub ttls: SessionTtls,
    pub session_idle: chrono::Duration,
    pub transaction_limit: usize,
    pub answer_timeout: Duration,
    pub credential_mode: CredentialMode,
    pub log_format: LogFormat,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("port", &self.port)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("llm_model", &self.llm_model)
            .field("telegram_bot_token", &self.telegram_bot_token.as_ref().map(|_| "<set>"))
            .field("telegram_api_base", &self.telegram_api_base)
            .field("api_token", &self.api_token.as_ref().map(|_| "<set>"))
            .field("ttls", &self.ttls)
            .field("session_idle", &self.session_idle)
            .field("transaction_limit", &self.transaction_limit)
            .field("answer_timeout", &self.answer_timeout)
            .field("credential_mode", &self.credential_mode)
            .field("log_format", &self.log_format)
            .finish_non_exhaustive()
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let openrouter_api_key = get("OPENROUTER_API_KEY")
            .context("OPENROUTER_API_KEY environment variable is required")?;

        let scratch_secs = parse_or(&get, "SCRATCH_TTL_SECS", 300_i64)?;
        let session_secs = parse_or(&get, "SESSION_TTL_SECS", 3600_i64)?;
        let idle_secs = parse_or(&get, "SESSION_IDLE_SECS", 86_400_i64)?;
        if scratch_secs <= 0 || session_secs <= 0 {
            bail!("SCRATCH_TTL_SECS and SESSION_TTL_SECS must be positive");
        }
        if scratch_secs > MAX_TTL_SECS || session_secs > MAX_TTL_SECS {
            bail!("SCRATCH_TTL_SECS and SESSION_TTL_SECS must not exceed {MAX_TTL_SECS}");
        }
        if idle_secs > MAX_IDLE_SECS {
            bail!("SESSION_IDLE_SECS must not exceed {MAX_IDLE_SECS}");
        }
        if idle_secs <= session_secs {
            bail!(
                "SESSION_IDLE_SECS ({idle_secs}) must exceed SESSION_TTL_SECS ({session_secs})"
            );
        }

        let transaction_limit = parse_or(&get, "TRANSACTION_LIMIT", 5_usize)?;
        if transaction_limit == 0 {
            bail!("TRANSACTION_LIMIT must be at least 1");
        }

        let credential_mode = match get("CREDENTIAL_MODE") {
            Some(raw) => raw.parse()?,
            None => CredentialMode::Compatible,
        };

        Ok(Self {
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            database_url: get("DATABASE_URL"),
            openrouter_api_key,
            llm_model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            telegram_bot_token: get("TELEGRAM_BOT_TOKEN"),
            telegram_api_base: get("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            telegram_webhook_secret: get("TELEGRAM_WEBHOOK_SECRET"),
            api_token: get("API_TOKEN"),
            ttls: SessionTtls {
                scratch: chrono::Duration::seconds(scratch_secs),
                authenticated: chrono::Duration::seconds(session_secs),
            },
            session_idle: chrono::Duration::seconds(idle_secs),
            transaction_limit,
            answer_timeout: Duration::from_secs(parse_or(&get, "ANSWER_TIMEOUT_SECS", 10_u64)?),
            credential_mode,
            log_format: get("LOG_FORMAT")
                .map(|raw| LogFormat::parse(&raw))
                .unwrap_or(LogFormat::Json),
        })
    }

    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            ttls: self.ttls,
            transaction_limit: self.transaction_limit,
            ..FlowSettings::default()
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} '{raw}': {e}")),
        None => Ok(default),
    }
}

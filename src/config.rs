//! Server configuration via CLI args and environment variables.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use codegate_service::clock::{Clock, SystemClock};
use codegate_service::generator::{DEFAULT_ENDPOINT, DEFAULT_MODEL, GeminiConfig, GenerationError};
use codegate_service::ledger::{
    DurableLedger, LedgerError, MemoryDurableLedger, MemoryVolatileLedger, VolatileLedger,
};
use codegate_service::policy::{PolicyError, WindowPolicy};
use codegate_service::principal::{ApiKeyResolver, PrincipalResolver, SessionResolver};
use codegate_service::{Ledgers, ServiceConfig};

/// Quota-gated streaming gateway for AI code assistance.
#[derive(Parser, Debug, Clone)]
#[command(name = "codegate-server", version, about)]
pub struct Config {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0", env = "CODEGATE_HOST")]
    pub host: String,

    /// Bind port.
    #[arg(long, default_value_t = 5000, env = "CODEGATE_PORT")]
    pub port: u16,

    /// Log level.
    #[arg(long, default_value = "info", env = "CODEGATE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format: "text" or "json".
    #[arg(long, default_value = "text", env = "CODEGATE_LOG_FORMAT")]
    pub log_format: String,

    /// CORS allowed origins (comma-separated). Empty for no CORS.
    #[arg(long, env = "CODEGATE_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Redis URL for the volatile counters. Omit to keep them in process.
    #[arg(long, env = "CODEGATE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// SQLite file for the durable quota records. Omit to keep them in process.
    #[arg(long, env = "CODEGATE_DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// JSON file overriding entries of the default window policy.
    #[arg(long, env = "CODEGATE_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// API keys as `token=userId` pairs (comma-separated).
    #[arg(long, env = "CODEGATE_API_KEYS", value_delimiter = ',', hide_env_values = true)]
    pub api_keys: Vec<String>,

    /// Gemini API key. Without it every generation fails with 502.
    #[arg(long, env = "CODEGATE_GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Gemini model name.
    #[arg(long, default_value = DEFAULT_MODEL, env = "CODEGATE_GEMINI_MODEL")]
    pub gemini_model: String,

    /// Gemini API base URL.
    #[arg(long, default_value = DEFAULT_ENDPOINT, env = "CODEGATE_GEMINI_ENDPOINT")]
    pub gemini_endpoint: String,

    /// Maximum stream duration in seconds (0 = unbounded).
    #[arg(long, default_value_t = 120, env = "CODEGATE_MAX_STREAM_SECS")]
    pub max_stream_secs: u64,

    /// Honour `X-Forwarded-For` when fingerprinting guests. Enable only
    /// behind a reverse proxy that sets it.
    #[arg(long, env = "CODEGATE_TRUST_FORWARDED_FOR")]
    pub trust_forwarded_for: bool,
}

/// Startup failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid bind address {0}")]
    InvalidHost(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("{0} was configured but this build lacks the `{1}` feature")]
    BackendDisabled(&'static str, &'static str),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Generator(#[from] GenerationError),
}

impl Config {
    /// Parses configuration from CLI args and env vars.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.host.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Loads and validates the window policy.
    pub fn policy(&self) -> Result<WindowPolicy, ConfigError> {
        let Some(path) = &self.policy_file else {
            return Ok(WindowPolicy::default());
        };
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(WindowPolicy::from_json(&json)?)
    }

    pub fn max_stream_duration(&self) -> Option<Duration> {
        (self.max_stream_secs > 0).then(|| Duration::from_secs(self.max_stream_secs))
    }

    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        Ok(ServiceConfig {
            policy: self.policy()?,
            max_stream_duration: self.max_stream_duration(),
        })
    }

    /// Bearer-token resolver over the configured API keys.
    pub fn principal_resolver(&self) -> PrincipalResolver {
        if self.api_keys.is_empty() {
            tracing::warn!("No API keys configured, every caller is a guest");
            return PrincipalResolver::default();
        }
        let keys = ApiKeyResolver::from_pairs(self.api_keys.iter().map(String::as_str));
        let sessions: Arc<dyn SessionResolver> = Arc::new(keys);
        PrincipalResolver::new(Some(sessions))
    }

    pub fn gemini_config(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone().filter(|k| !k.is_empty()),
            model: self.gemini_model.clone(),
            endpoint: self.gemini_endpoint.clone(),
        }
    }

    /// Connects both ledgers. Absent settings fall back to in-process stores.
    pub async fn connect_ledgers(&self, clock: Arc<dyn Clock>) -> Result<Ledgers, ConfigError> {
        Ok(Ledgers {
            volatile: self.volatile_ledger(clock).await?,
            durable: self.durable_ledger()?,
        })
    }

    async fn volatile_ledger(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn VolatileLedger>, ConfigError> {
        let Some(url) = &self.redis_url else {
            tracing::warn!("No Redis URL configured, volatile counters are per process");
            return Ok(Arc::new(MemoryVolatileLedger::new(clock)));
        };

        #[cfg(feature = "redis")]
        {
            let ledger = codegate_service::ledger::RedisVolatileLedger::connect(url).await?;
            tracing::info!("Connected volatile ledger to Redis");
            Ok(Arc::new(ledger))
        }

        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            Err(ConfigError::BackendDisabled("--redis-url", "redis"))
        }
    }

    fn durable_ledger(&self) -> Result<Arc<dyn DurableLedger>, ConfigError> {
        let Some(path) = &self.database_path else {
            tracing::warn!("No database path configured, durable quotas are lost on restart");
            return Ok(Arc::new(MemoryDurableLedger::new()));
        };

        #[cfg(feature = "sqlite")]
        {
            let ledger = codegate_service::ledger::SqliteDurableLedger::open(path)?;
            tracing::info!(path = %path.display(), "Opened durable ledger");
            Ok(Arc::new(ledger))
        }

        #[cfg(not(feature = "sqlite"))]
        {
            let _ = path;
            Err(ConfigError::BackendDisabled("--database-path", "sqlite"))
        }
    }
}

/// Default clock for production ledgers.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

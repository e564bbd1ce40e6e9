use std::path::PathBuf;

use anyhow::{Context, Result};

/// Runtime configuration, read from `FLOW_RUNNER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Size of the worker set; each worker runs one task end-to-end.
    pub max_jobs: usize,
    /// Per-client active-task limit.
    pub client_task_limit: usize,
    /// Default seconds to wait for a response to an outstanding prompt.
    pub input_timeout: u64,
    /// Default task max duration in seconds; 0 disables the limit.
    pub max_task_duration: u64,
    /// Days before soft-deleted tasks and their streams are purged.
    pub task_retention_days: u64,
    pub db_path: PathBuf,
    pub storage_root: PathBuf,
    /// Directory for per-task child I/O sockets.
    pub socket_dir: PathBuf,
    /// Command used to run a flow file; overridable for tests and deploys.
    pub agent_cmd: String,
    pub local_client_id: String,
    pub local_client_secret: String,
    /// External permission oracle; absence means allow.
    pub permission_verify_url: Option<String>,
    pub permission_secret: Option<String>,
    pub trusted_origins: Vec<String>,
    /// Max entries kept per output stream.
    pub max_stream_size: usize,
    /// Seconds between SIGTERM and SIGKILL on cancellation.
    pub cancel_grace_secs: u64,
    /// Window to drain remaining output after a terminal transition.
    pub drain_window_ms: u64,
}

const ENV_PREFIX: &str = "FLOW_RUNNER_";

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Invalid value for {}{}: {}", ENV_PREFIX, name, raw)),
        None => Ok(default),
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_jobs: 5,
            client_task_limit: 3,
            input_timeout: 180,
            max_task_duration: 0,
            task_retention_days: 30,
            db_path: PathBuf::from("flow-runner.db"),
            storage_root: PathBuf::from("storage"),
            socket_dir: std::env::temp_dir().join("flow-runner"),
            agent_cmd: "flow-agent".to_string(),
            local_client_id: "local".to_string(),
            local_client_secret: String::new(),
            permission_verify_url: None,
            permission_secret: None,
            trusted_origins: Vec::new(),
            max_stream_size: 1000,
            cancel_grace_secs: 10,
            drain_window_ms: 500,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    /// A missing local client secret is generated on the fly with a warning,
    /// so a bare dev invocation still starts.
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();
        let max_jobs: usize = env_parse("MAX_JOBS", defaults.max_jobs)?;
        if !(1..=100).contains(&max_jobs) {
            anyhow::bail!("{}MAX_JOBS must be between 1 and 100, got {}", ENV_PREFIX, max_jobs);
        }

        let local_client_secret = match env_var("LOCAL_CLIENT_SECRET") {
            Some(secret) => secret,
            None => {
                let generated = uuid::Uuid::new_v4().simple().to_string();
                tracing::warn!("Generated a random value for LOCAL_CLIENT_SECRET");
                generated
            }
        };

        Ok(Self {
            host: env_var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port)?,
            max_jobs,
            client_task_limit: env_parse("CLIENT_TASK_LIMIT", defaults.client_task_limit)?,
            input_timeout: env_parse("INPUT_TIMEOUT", defaults.input_timeout)?,
            max_task_duration: env_parse("MAX_TASK_DURATION", defaults.max_task_duration)?,
            task_retention_days: env_parse("TASK_RETENTION_DAYS", defaults.task_retention_days)?,
            db_path: env_var("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            storage_root: env_var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            socket_dir: env_var("SOCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_dir),
            agent_cmd: env_var("AGENT_CMD").unwrap_or(defaults.agent_cmd),
            local_client_id: env_var("LOCAL_CLIENT_ID").unwrap_or(defaults.local_client_id),
            local_client_secret,
            permission_verify_url: env_var("PERMISSION_VERIFY_URL"),
            permission_secret: env_var("PERMISSION_SECRET"),
            trusted_origins: env_var("TRUSTED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            max_stream_size: env_parse("MAX_STREAM_SIZE", defaults.max_stream_size)?,
            cancel_grace_secs: env_parse("CANCEL_GRACE_SECS", defaults.cancel_grace_secs)?,
            drain_window_ms: env_parse("DRAIN_WINDOW_MS", defaults.drain_window_ms)?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage_root).context("Failed to create storage root")?;
        std::fs::create_dir_all(&self.socket_dir).context("Failed to create socket directory")?;
        if let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        Ok(())
    }
}

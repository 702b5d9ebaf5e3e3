use std::{env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use uuid::Uuid;

/// Knobs consumed by the orchestration core.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_keep_alive: Duration,
    /// A job still running after this long is forcibly failed.
    pub max_job_lifetime: Duration,
    /// A finished job stays in memory this long before it is persisted and evicted.
    pub job_cache_lifetime: Duration,
    pub poll_interval: Duration,
    pub purge_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            min_workers: 3,
            max_workers: 100,
            worker_keep_alive: Duration::from_secs(60),
            max_job_lifetime: Duration::from_secs(12 * 60 * 60),
            job_cache_lifetime: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(2),
            purge_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub database_path: PathBuf,
    pub model_root: PathBuf,
    pub query_service_url: String,
    pub udf_name: String,
    pub udf_class: String,
    pub lifecycle: LifecycleConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("ML_JOBS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let database_path = PathBuf::from(
            env::var("ML_JOBS_DATABASE_PATH").unwrap_or_else(|_| "/data/ml-jobs.sqlite".to_string()),
        );
        let model_root = PathBuf::from(
            env::var("ML_JOBS_MODEL_ROOT").unwrap_or_else(|_| "/data/models".to_string()),
        );
        let query_service_url = env::var("ML_JOBS_QUERY_SERVICE_URL")
            .unwrap_or_else(|_| "http://localhost:9999/lensapi".to_string());
        let udf_name = env::var("ML_JOBS_UDF_NAME").unwrap_or_else(|_| "predict".to_string());
        let udf_class = env::var("ML_JOBS_UDF_CLASS")
            .unwrap_or_else(|_| "org.apache.lens.ml.impl.HiveMLUDF".to_string());

        let defaults = LifecycleConfig::default();
        let lifecycle = LifecycleConfig {
            min_workers: env_parse("ML_JOBS_MIN_WORKERS").unwrap_or(defaults.min_workers),
            max_workers: env_parse("ML_JOBS_MAX_WORKERS").unwrap_or(defaults.max_workers),
            worker_keep_alive: env_millis("ML_JOBS_WORKER_KEEP_ALIVE_MS")
                .unwrap_or(defaults.worker_keep_alive),
            max_job_lifetime: env_millis("ML_JOBS_MAX_JOB_LIFETIME_MS")
                .unwrap_or(defaults.max_job_lifetime),
            job_cache_lifetime: env_millis("ML_JOBS_JOB_CACHE_LIFETIME_MS")
                .unwrap_or(defaults.job_cache_lifetime),
            poll_interval: env_millis("ML_JOBS_POLL_INTERVAL_MS").unwrap_or(defaults.poll_interval),
            purge_interval: env_millis("ML_JOBS_PURGE_INTERVAL_MS")
                .unwrap_or(defaults.purge_interval),
        };

        if lifecycle.min_workers > lifecycle.max_workers || lifecycle.max_workers == 0 {
            anyhow::bail!(
                "ML_JOBS_MIN_WORKERS ({}) must be <= ML_JOBS_MAX_WORKERS ({}) and the max must be positive",
                lifecycle.min_workers,
                lifecycle.max_workers
            );
        }

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            database_path,
            model_root,
            query_service_url,
            udf_name,
            udf_class,
            lifecycle,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("ML_JOBS_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("ML_JOBS_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[ml-job-orchestrator] ML_JOBS_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[ml-job-orchestrator] Failed reading ML_JOBS_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!("[ml-job-orchestrator] ML_JOBS_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}

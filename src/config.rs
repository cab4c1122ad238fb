use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::ExportFormat;

/// Process configuration, resolved once at startup from environment
/// variables. Every key is read as `QUERYFERRY_<KEY>` first and the
/// bare `<KEY>` second; unknown environment keys are ignored.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub spool_root: String,
    pub global_max_parallel_queries: usize,
    pub default_max_parallel_queries: i64,
    pub listener_interval_seconds: u64,
    pub listener_jitter_millis: u64,
    pub listener_log_level: String,
    pub default_export_type: ExportFormat,
    pub default_export_location: String,
    pub default_ssh_host: String,
    pub default_ssh_port: u16,
    pub default_ssh_user: String,
    pub default_ssh_password: String,
    pub ssh_connect_timeout_seconds: u64,
    pub shutdown_grace_seconds: u64,
    pub stale_threshold_seconds: i64,
    pub job_timeout_seconds: u64,
    pub fetch_chunk_size: usize,
    pub keep_local_exports: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "./queryferry-data/jobs.db".to_string(),
            spool_root: "./tmp/exports".to_string(),
            global_max_parallel_queries: 50,
            default_max_parallel_queries: 3,
            listener_interval_seconds: 10,
            listener_jitter_millis: 500,
            listener_log_level: "info".to_string(),
            default_export_type: ExportFormat::Csv,
            default_export_location: "./exports".to_string(),
            default_ssh_host: String::new(),
            default_ssh_port: 22,
            default_ssh_user: String::new(),
            default_ssh_password: String::new(),
            ssh_connect_timeout_seconds: 30,
            shutdown_grace_seconds: 30,
            stale_threshold_seconds: 300,
            job_timeout_seconds: 3600,
            fetch_chunk_size: 500,
            keep_local_exports: true,
        }
    }
}

impl AppConfig {
    pub fn load() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    fn apply_env(&mut self) {
        set_opt(&mut self.database_path, env_string("DATABASE_PATH"));
        set_opt(&mut self.spool_root, env_string("SPOOL_ROOT"));
        set_opt_usize_min(
            &mut self.global_max_parallel_queries,
            env_parse("GLOBAL_MAX_PARALLEL_QUERIES"),
            1,
        );
        set_opt_i64_min(
            &mut self.default_max_parallel_queries,
            env_parse("DEFAULT_MAX_PARALLEL_QUERIES"),
            1,
        );
        set_opt_u64_min(
            &mut self.listener_interval_seconds,
            env_parse("LISTENER_INTERVAL_SECONDS"),
            1,
        );
        set_opt(
            &mut self.listener_jitter_millis,
            env_parse("LISTENER_JITTER_MILLIS"),
        );
        set_opt(&mut self.listener_log_level, env_string("LISTENER_LOG_LEVEL"));
        if let Some(raw) = env_string("DEFAULT_EXPORT_TYPE") {
            if let Ok(format) = ExportFormat::from_str(raw.trim()) {
                self.default_export_type = format;
            }
        }
        set_opt(
            &mut self.default_export_location,
            env_string("DEFAULT_EXPORT_LOCATION"),
        );
        set_opt(&mut self.default_ssh_host, env_string("DEFAULT_SSH_HOST"));
        set_opt(&mut self.default_ssh_port, env_parse("DEFAULT_SSH_PORT"));
        set_opt(&mut self.default_ssh_user, env_string("DEFAULT_SSH_USER"));
        set_opt(
            &mut self.default_ssh_password,
            env_string("DEFAULT_SSH_PASSWORD"),
        );
        set_opt_u64_min(
            &mut self.ssh_connect_timeout_seconds,
            env_parse("SSH_CONNECT_TIMEOUT_SECONDS"),
            1,
        );
        set_opt_u64_min(
            &mut self.shutdown_grace_seconds,
            env_parse("SHUTDOWN_GRACE_SECONDS"),
            1,
        );
        set_opt_i64_min(
            &mut self.stale_threshold_seconds,
            env_parse("STALE_THRESHOLD_SECONDS"),
            1,
        );
        set_opt_u64_min(
            &mut self.job_timeout_seconds,
            env_parse("JOB_TIMEOUT_SECONDS"),
            1,
        );
        set_opt_usize_min(&mut self.fetch_chunk_size, env_parse("FETCH_CHUNK_SIZE"), 1);
        if let Some(raw) = env_string("KEEP_LOCAL_EXPORTS") {
            if let Some(value) = parse_bool_text(&raw) {
                self.keep_local_exports = value;
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.database_path)
    }

    pub fn spool_root(&self) -> PathBuf {
        PathBuf::from(&self.spool_root)
    }

    pub fn listener_interval(&self) -> Duration {
        Duration::from_secs(self.listener_interval_seconds)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_threshold_seconds)
    }
}

fn env_string(key: &str) -> Option<String> {
    let primary = format!("QUERYFERRY_{key}");
    if let Ok(value) = env::var(&primary) {
        return Some(value);
    }
    env::var(key).ok()
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|raw| raw.trim().parse::<T>().ok())
}

fn parse_bool_text(raw: &str) -> Option<bool> {
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn set_opt<T>(dst: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *dst = v;
    }
}

fn set_opt_usize_min(dst: &mut usize, value: Option<usize>, min: usize) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_u64_min(dst: &mut u64, value: Option<u64>, min: u64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

fn set_opt_i64_min(dst: &mut i64, value: Option<i64>, min: i64) {
    if let Some(v) = value {
        *dst = v.max(min);
    }
}

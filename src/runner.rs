use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::json;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{ClaimLimits, JobDb, TransitionUpdate};
use crate::errors::{redact_secrets, ErrorKind, JobError};
use crate::executor;
use crate::export;
use crate::models::{Job, JobSpec, JobStatus, UserSettings};
use crate::transfer::{self, SshAuth, TransferTarget};

/// The dispatcher: a single listener loop that polls the job store for
/// admissible work and hands each claimed job to its own worker task.
/// The global semaphore and the per-user slot counters here are the
/// only process-wide mutable state outside the store itself.
pub struct JobRunner {
    db: Arc<JobDb>,
    config: Arc<AppConfig>,
    gate: Arc<Semaphore>,
    slots: Mutex<HashMap<i64, usize>>,
    handles: Mutex<HashMap<i64, tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
    wake: Notify,
    generation: String,
}

impl JobRunner {
    pub fn new(db: Arc<JobDb>, config: Arc<AppConfig>) -> Arc<Self> {
        let capacity = config.global_max_parallel_queries.max(1);
        Arc::new(Self {
            db,
            config,
            gate: Arc::new(Semaphore::new(capacity)),
            slots: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            wake: Notify::new(),
            generation: Uuid::new_v4().to_string(),
        })
    }

    /// Boot identifier stamped onto claimed rows; rows carrying any
    /// other generation are orphans as far as recovery is concerned.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Startup pass: returns orphaned non-terminal jobs to `pending`.
    pub async fn recover(&self) -> Result<u64> {
        let reclaimed = self
            .db
            .reclaim_stale(&self.generation, self.config.stale_threshold())
            .await
            .context("recovery failed")?;
        for id in &reclaimed {
            debug!(job_id = id, "reclaimed orphaned job");
        }
        Ok(reclaimed.len() as u64)
    }

    /// Inserts a job and nudges the listener so it does not wait out
    /// the full poll interval.
    pub async fn enqueue(&self, spec: &JobSpec) -> Result<i64> {
        let id = self.db.enqueue(spec).await?;
        self.wake.notify_one();
        Ok(id)
    }

    pub fn notify_enqueued(&self) {
        self.wake.notify_one();
    }

    /// Starts the listener loop. The returned handle completes once
    /// shutdown has been requested and the loop has wound down.
    pub fn spawn_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                if runner.shutdown.is_cancelled() {
                    break;
                }
                if let Err(err) = runner.dispatch_ready().await {
                    error!("dispatch pass failed: {err:#}");
                }
                let interval = runner.sleep_duration_with_jitter();
                tokio::select! {
                    _ = runner.shutdown.cancelled() => break,
                    _ = runner.wake.notified() => {}
                    _ = sleep(interval) => {}
                }
            }
            debug!("listener loop stopped");
        })
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        let interval = self.config.listener_interval();
        if self.config.listener_jitter_millis == 0 {
            return interval;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.config.listener_jitter_millis);
        interval + Duration::from_millis(jitter)
    }

    /// Admits claimable jobs until the store runs dry or the global
    /// gate is saturated. Admission and execution are decoupled: each
    /// claim spawns a worker that owns the job for its whole lifetime.
    async fn dispatch_ready(self: &Arc<Self>) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let Ok(permit) = self.gate.clone().try_acquire_owned() else {
                return Ok(());
            };

            let limits = ClaimLimits {
                global_cap: self.config.global_max_parallel_queries as i64,
                default_user_cap: self.config.default_max_parallel_queries,
                generation: self.generation.clone(),
            };
            let Some(job) = self.db.claim_next(&limits).await? else {
                return Ok(());
            };

            let user_cap = self
                .db
                .user_parallel_limit(job.user_id, self.config.default_max_parallel_queries)
                .await?;
            if !self.try_acquire_slot(job.user_id, user_cap.max(1) as usize).await {
                // The store said yes but the in-process counter is
                // full; leave the row queued and let the next pass or
                // recovery pick it up.
                warn!(job_id = job.id, user_id = job.user_id, "per-user slots exhausted");
                return Ok(());
            }

            let token = self.shutdown.child_token();

            let job = match self
                .db
                .transition(job.id, JobStatus::Running, TransitionUpdate::default())
                .await
            {
                Ok(job) => job,
                Err(err) => {
                    error!(job_id = job.id, "failed starting claimed job: {err:#}");
                    self.release_slot(job.user_id).await;
                    return Err(err);
                }
            };

            let runner = self.clone();
            let job_id = job.id;
            let handle = tokio::spawn(async move {
                runner.execute_job(job, permit, token).await;
            });
            self.handles.lock().await.insert(job_id, handle);
        }
    }

    async fn execute_job(
        self: Arc<Self>,
        job: Job,
        permit: tokio::sync::OwnedSemaphorePermit,
        token: CancellationToken,
    ) {
        // Held across the entire run/export/transfer sequence.
        let _permit = permit;
        let job_id = job.id;
        let user_id = job.user_id;
        info!(job_id, user_id, "job started");

        let settings = match self.db.get_user_settings(user_id).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(job_id, "failed loading user settings, using defaults: {err:#}");
                None
            }
        };

        let outcome = match tokio::time::timeout(
            self.config.job_timeout(),
            self.run_pipeline(&job, settings.as_ref(), &token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(JobError::timeout(format!(
                    "job exceeded {}s wall-clock limit",
                    self.config.job_timeout_seconds
                )))
            }
        };

        match outcome {
            Ok(metadata) => {
                let update = TransitionUpdate {
                    metadata: Some(metadata),
                    ..Default::default()
                };
                match self.db.transition(job_id, JobStatus::Completed, update).await {
                    Ok(_) => info!(job_id, "job completed"),
                    Err(err) => error!(job_id, "failed recording completion: {err:#}"),
                }
            }
            Err(job_err) => {
                let message = redact_secrets(
                    &job_err.to_string(),
                    &[
                        Some(job.db_password.as_str()),
                        settings.as_ref().and_then(|s| s.ssh_password.as_deref()),
                        settings.as_ref().and_then(|s| s.ssh_key_passphrase.as_deref()),
                        settings.as_ref().and_then(|s| s.ssh_key.as_deref()),
                    ],
                );
                warn!(job_id, "job failed: {message}");
                let update = TransitionUpdate {
                    error_message: Some(message),
                    ..Default::default()
                };
                if let Err(err) = self.db.transition(job_id, JobStatus::Failed, update).await {
                    // The row stays non-terminal; the next recovery
                    // pass will return it to pending.
                    error!(job_id, "failed recording failure: {err:#}");
                }
            }
        }

        self.finish(job_id, user_id).await;
    }

    /// Query -> export -> optional transfer. Returns the job's result
    /// metadata on success; every failure is already classified.
    async fn run_pipeline(
        &self,
        job: &Job,
        settings: Option<&UserSettings>,
        token: &CancellationToken,
    ) -> Result<serde_json::Value, JobError> {
        let format = job
            .export_format
            .or_else(|| settings.and_then(|s| s.export_type))
            .unwrap_or(self.config.default_export_type);
        let local_path = export::spool_path(&self.config.spool_root(), job.user_id, job.id, format);

        let stream = executor::run_query(job, self.config.fetch_chunk_size, token).await?;
        let summary = export::export_rows(stream, format, &local_path, token).await?;

        let mut metadata = json!({
            "row_count": summary.row_count,
            "column_count": summary.column_count,
            "byte_size": summary.byte_size,
            "local_path": local_path.to_string_lossy(),
        });

        let ssh_hostname = job
            .ssh_hostname
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty());
        if let Some(host) = ssh_hostname {
            // Checkpoint the export before the push so a transfer
            // failure still surfaces where the file landed locally.
            self.db
                .transition(
                    job.id,
                    JobStatus::Transferring,
                    TransitionUpdate {
                        metadata: Some(metadata.clone()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|err| JobError::internal(format!("failed recording transfer start: {err:#}")))?;

            let target = self.resolve_transfer_target(host, settings)?;
            let remote_dir = job
                .export_location
                .clone()
                .or_else(|| settings.and_then(|s| s.export_location.clone()))
                .unwrap_or_else(|| self.config.default_export_location.clone());
            let remote_name = job
                .export_filename
                .clone()
                .unwrap_or_else(|| export::default_remote_filename(job.id, format));

            let remote_path = transfer::push_file(
                local_path.clone(),
                target,
                remote_dir,
                remote_name,
                token.clone(),
            )
            .await?;
            metadata["remote_path"] = json!(remote_path);

            if !self.config.keep_local_exports {
                let _ = tokio::fs::remove_file(&local_path).await;
            }
        }

        Ok(metadata)
    }

    fn resolve_transfer_target(
        &self,
        host: &str,
        settings: Option<&UserSettings>,
    ) -> Result<TransferTarget, JobError> {
        let port = settings
            .and_then(|s| s.ssh_port)
            .unwrap_or(self.config.default_ssh_port);
        let username = settings
            .and_then(|s| s.ssh_username.clone())
            .filter(|name| !name.trim().is_empty())
            .or_else(|| {
                (!self.config.default_ssh_user.is_empty())
                    .then(|| self.config.default_ssh_user.clone())
            })
            .ok_or_else(|| {
                JobError::new(ErrorKind::SshAuth, "no ssh username configured for transfer")
            })?;

        let key = settings
            .and_then(|s| s.ssh_key.clone())
            .filter(|key| !key.trim().is_empty());
        let auth = if let Some(key) = key {
            SshAuth::PrivateKey {
                key,
                passphrase: settings.and_then(|s| s.ssh_key_passphrase.clone()),
            }
        } else if let Some(password) = settings
            .and_then(|s| s.ssh_password.clone())
            .filter(|p| !p.is_empty())
        {
            SshAuth::Password(password)
        } else if !self.config.default_ssh_password.is_empty() {
            SshAuth::Password(self.config.default_ssh_password.clone())
        } else {
            return Err(JobError::new(
                ErrorKind::SshAuth,
                "no ssh credentials configured for transfer",
            ));
        };

        Ok(TransferTarget {
            host: host.to_string(),
            port,
            username,
            auth,
            connect_timeout: self.config.ssh_connect_timeout(),
        })
    }

    async fn try_acquire_slot(&self, user_id: i64, cap: usize) -> bool {
        let mut slots = self.slots.lock().await;
        let count = slots.entry(user_id).or_insert(0);
        if *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    async fn release_slot(&self, user_id: i64) {
        let mut slots = self.slots.lock().await;
        if let Some(count) = slots.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                slots.remove(&user_id);
            }
        }
    }

    /// Release-everything path taken by every worker exit.
    async fn finish(&self, job_id: i64, user_id: i64) {
        self.handles.lock().await.remove(&job_id);
        self.release_slot(user_id).await;
        self.wake.notify_one();
    }

    /// Cancels all in-flight workers and waits up to `grace` for them
    /// to observe the signal and release their resources; stragglers
    /// are aborted and left for the next recovery pass.
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutdown requested; cancelling in-flight jobs");
        self.shutdown.cancel();

        let deadline = Instant::now() + grace;
        loop {
            let in_flight = {
                let mut handles = self.handles.lock().await;
                handles.retain(|_, handle| !handle.is_finished());
                handles.len()
            };
            if in_flight == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("shutdown grace expired with {in_flight} jobs in flight; aborting");
                for (_, handle) in self.handles.lock().await.drain() {
                    handle.abort();
                }
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        info!("dispatcher stopped");
    }
}

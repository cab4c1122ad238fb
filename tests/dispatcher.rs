use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

use queryferry::config::AppConfig;
use queryferry::db::JobDb;
use queryferry::models::{Job, JobSpec, JobStatus, UserSettings};
use queryferry::runner::JobRunner;

mod test_utils {
    use super::*;

    pub(super) struct Harness {
        pub dir: TempDir,
        pub db: Arc<JobDb>,
        pub runner: Arc<JobRunner>,
        pub target_dsn: String,
    }

    pub(super) async fn harness() -> Result<Harness> {
        let dir = tempfile::tempdir()?;
        let target_path = dir.path().join("target.db");
        seed_target_db(&target_path).await?;

        let config = Arc::new(AppConfig {
            database_path: dir.path().join("jobs.db").display().to_string(),
            spool_root: dir.path().join("spool").display().to_string(),
            listener_interval_seconds: 1,
            listener_jitter_millis: 0,
            ssh_connect_timeout_seconds: 2,
            ..AppConfig::default()
        });
        let db = Arc::new(JobDb::new(&config.database_path()).await?);
        let runner = JobRunner::new(db.clone(), config);

        Ok(Harness {
            target_dsn: format!("sqlite://{}", target_path.display()),
            dir,
            db,
            runner,
        })
    }

    async fn seed_target_db(path: &Path) -> Result<()> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL)")
            .execute(&pool)
            .await?;
        for (id, name, score) in [(1, "ada", 9.5), (2, "grace", 8.25), (3, "edsger", 7.0)] {
            sqlx::query("INSERT INTO items (id, name, score) VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(score)
                .execute(&pool)
                .await?;
        }
        pool.close().await;
        Ok(())
    }

    pub(super) fn job_spec(user_id: i64, dsn: &str, query: &str) -> JobSpec {
        JobSpec {
            user_id,
            db_username: String::new(),
            db_password: String::new(),
            db_dsn: dsn.to_string(),
            query_text: query.to_string(),
            export_format: None,
            export_location: None,
            export_filename: None,
            ssh_hostname: None,
        }
    }

    pub(super) async fn wait_for_terminal(
        db: &JobDb,
        id: i64,
        deadline: Duration,
    ) -> Result<Job> {
        wait_for(db, id, deadline, |job| job.status.is_terminal()).await
    }

    pub(super) async fn wait_for(
        db: &JobDb,
        id: i64,
        deadline: Duration,
        pred: impl Fn(&Job) -> bool,
    ) -> Result<Job> {
        let start = Instant::now();
        loop {
            let job = db.get(id).await?.expect("job exists");
            if pred(&job) {
                return Ok(job);
            }
            if start.elapsed() > deadline {
                anyhow::bail!(
                    "job {id} still in status {} after {deadline:?}",
                    job.status.as_str()
                );
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

use test_utils::{harness, job_spec, wait_for, wait_for_terminal};

#[tokio::test]
async fn job_runs_to_completion_and_records_metadata() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;
    let listener = h.runner.spawn_listener();

    let id = h
        .runner
        .enqueue(&job_spec(
            alice,
            &h.target_dsn,
            "SELECT id, name, score FROM items ORDER BY id",
        ))
        .await?;

    let job = wait_for_terminal(&h.db, id, Duration::from_secs(30)).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());

    assert_eq!(job.result_metadata["row_count"], serde_json::json!(3));
    assert_eq!(job.result_metadata["column_count"], serde_json::json!(3));

    let local_path = PathBuf::from(
        job.result_metadata["local_path"]
            .as_str()
            .expect("local_path recorded"),
    );
    assert_eq!(
        local_path,
        h.dir.path().join("spool").join(alice.to_string()).join(format!("{id}.csv"))
    );
    let on_disk = std::fs::metadata(&local_path)?.len();
    assert_eq!(job.result_metadata["byte_size"], serde_json::json!(on_disk));

    h.runner.shutdown(Duration::from_secs(5)).await;
    let _ = listener.await;
    Ok(())
}

#[tokio::test]
async fn capped_user_jobs_all_complete_without_exceeding_the_cap() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;
    h.db.upsert_user_settings(&UserSettings {
        user_id: alice,
        max_parallel_queries: Some(2),
        ..Default::default()
    })
    .await?;
    let listener = h.runner.spawn_listener();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(
            h.runner
                .enqueue(&job_spec(alice, &h.target_dsn, "SELECT id FROM items"))
                .await?,
        );
    }

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let counts = h.db.current_counts().await?;
        assert!(
            counts.queued + counts.running + counts.transferring <= 2,
            "admission exceeded the per-user cap: {counts:?}"
        );
        if counts.completed == ids.len() as i64 {
            break;
        }
        assert!(counts.failed == 0, "unexpected failures: {counts:?}");
        assert!(Instant::now() < deadline, "jobs did not drain in time");
        sleep(Duration::from_millis(20)).await;
    }

    h.runner.shutdown(Duration::from_secs(5)).await;
    let _ = listener.await;
    Ok(())
}

#[tokio::test]
async fn sql_errors_classify_as_db_execute() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;
    let listener = h.runner.spawn_listener();

    let id = h
        .runner
        .enqueue(&job_spec(alice, &h.target_dsn, "SELECT * FROM no_such_table"))
        .await?;

    let job = wait_for_terminal(&h.db, id, Duration::from_secs(30)).await?;
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.expect("error recorded");
    assert!(message.starts_with("DB_EXECUTE"), "unexpected error: {message}");

    h.runner.shutdown(Duration::from_secs(5)).await;
    let _ = listener.await;
    Ok(())
}

#[tokio::test]
async fn unreachable_ssh_target_fails_but_keeps_the_local_export() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;
    h.db.upsert_user_settings(&UserSettings {
        user_id: alice,
        ssh_port: Some(1),
        ssh_username: Some("ferry".to_string()),
        ssh_password: Some("sw0rdfish".to_string()),
        ..Default::default()
    })
    .await?;
    let listener = h.runner.spawn_listener();

    let mut spec = job_spec(alice, &h.target_dsn, "SELECT id, name FROM items");
    spec.ssh_hostname = Some("127.0.0.1".to_string());
    let id = h.runner.enqueue(&spec).await?;

    let job = wait_for_terminal(&h.db, id, Duration::from_secs(30)).await?;
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.expect("error recorded");
    assert!(
        message.starts_with("SSH_CONNECT"),
        "unexpected error: {message}"
    );
    assert!(!message.contains("sw0rdfish"), "credential leaked: {message}");

    // The export itself finished before the transfer failed.
    assert!(job.result_metadata["byte_size"].is_u64());
    let local_path = PathBuf::from(job.result_metadata["local_path"].as_str().unwrap());
    assert!(local_path.exists());

    h.runner.shutdown(Duration::from_secs(5)).await;
    let _ = listener.await;
    Ok(())
}

#[tokio::test]
async fn failed_job_reruns_to_completion_with_fresh_metadata() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;
    let listener = h.runner.spawn_listener();

    let id = h
        .runner
        .enqueue(&job_spec(alice, &h.target_dsn, "SELECT id FROM latecomers"))
        .await?;
    let job = wait_for_terminal(&h.db, id, Duration::from_secs(30)).await?;
    assert_eq!(job.status, JobStatus::Failed);

    // The table shows up afterwards; a rerun of the same row succeeds.
    let opts = SqliteConnectOptions::new().filename(h.dir.path().join("target.db"));
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    sqlx::query("CREATE TABLE latecomers (id INTEGER PRIMARY KEY)")
        .execute(&pool)
        .await?;
    sqlx::query("INSERT INTO latecomers (id) VALUES (1), (2)")
        .execute(&pool)
        .await?;
    pool.close().await;

    let rerun = h.db.mark_rerun(id).await?;
    assert_eq!(rerun.status, JobStatus::Pending);
    h.runner.notify_enqueued();

    let job = wait_for_terminal(&h.db, id, Duration::from_secs(30)).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.error_message.is_none());
    assert_eq!(job.result_metadata["row_count"], serde_json::json!(2));

    h.runner.shutdown(Duration::from_secs(5)).await;
    let _ = listener.await;
    Ok(())
}

#[tokio::test]
async fn recovery_requeues_orphans_which_then_complete() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;

    // Simulate a previous processor that died mid-run.
    let id = h
        .db
        .enqueue(&job_spec(alice, &h.target_dsn, "SELECT id FROM items"))
        .await?;
    let claimed = h
        .db
        .claim_next(&queryferry::db::ClaimLimits {
            global_cap: 50,
            default_user_cap: 3,
            generation: "dead-boot".to_string(),
        })
        .await?
        .expect("claimable");
    h.db.transition(
        claimed.id,
        JobStatus::Running,
        queryferry::db::TransitionUpdate::default(),
    )
    .await?;

    let requeued = h.runner.recover().await?;
    assert_eq!(requeued, 1);
    let job = h.db.get(id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());

    // Recovery is idempotent.
    assert_eq!(h.runner.recover().await?, 0);

    let listener = h.runner.spawn_listener();
    h.runner.notify_enqueued();
    let job = wait_for_terminal(&h.db, id, Duration::from_secs(30)).await?;
    assert_eq!(job.status, JobStatus::Completed);

    h.runner.shutdown(Duration::from_secs(5)).await;
    let _ = listener.await;
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_an_inflight_job_within_grace() -> Result<()> {
    let h = harness().await?;
    let alice = h.db.create_user("alice@example.com", "x").await?;
    let listener = h.runner.spawn_listener();

    // A statement that grinds for a long time before its first row.
    let slow = "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt \
                WHERE x < 100000000) SELECT count(*) FROM cnt";
    let id = h
        .runner
        .enqueue(&job_spec(alice, &h.target_dsn, slow))
        .await?;

    wait_for(&h.db, id, Duration::from_secs(30), |job| {
        job.status == JobStatus::Running
    })
    .await?;

    let begun = Instant::now();
    h.runner.shutdown(Duration::from_secs(10)).await;
    assert!(begun.elapsed() < Duration::from_secs(11));

    let job = h.db.get(id).await?.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.expect("error recorded");
    assert!(message.starts_with("CANCELED"), "unexpected error: {message}");

    let _ = listener.await;
    Ok(())
}

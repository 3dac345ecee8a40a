//! Command-line entry point wiring the queue, reaper, runner, and
//! materializer together. Grounded on the teacher's `server/main.rs`
//! startup sequence (tracing init → config → pool → migrations) and
//! `dev-cli`'s clap-derive subcommand style.
//!
//! Source adapters (the actual GitLab HTTP client, `git`/`svn` shell-outs)
//! are a deployment concern outside this workspace — see `scm-source`'s
//! trait boundary. `worker` runs with an empty handler registry unless a
//! caller wires one in via the library crates directly; `materialize`
//! reports the batch it would fetch rather than fetching it.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use scm_artifact_store::Store;
use scm_config::{AppConfig, ArtifactsBackend};
use scm_db::AppContext;
use scm_queue::JobQueue;
use scm_reaper::{ExpiredJobPolicy, Reaper, ReaperConfig};
use scm_run_recorder::RunRecorder;
use scm_runner::{Runner, RunnerDefaults};
use scm_types::job::JobType;
use scm_types::repo::RepoType;
use scm_worker::executor::ExecutorRegistry;
use scm_worker::heartbeat::HeartbeatConfig;
use scm_worker::{JobOutcome, WorkerConfig, WorkerLoop};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scm-sync")]
#[command(about = "Distributed SCM ingestion engine: worker, reaper, runner, materializer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim and process jobs from the queue.
    Worker(WorkerArgs),
    /// Recover orphaned running jobs, expired runs, and stale locks.
    Reaper(ReaperArgs),
    /// Enqueue incremental or backfill jobs.
    Runner {
        #[command(subcommand)]
        mode: RunnerMode,
    },
    /// Materialize pending/failed patch blobs into the artifact store.
    Materialize(MaterializeArgs),
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    worker_id: String,
    #[arg(long, value_delimiter = ',')]
    job_types: Option<Vec<String>>,
    #[arg(long)]
    once: bool,
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,
    #[arg(long)]
    lease_seconds: Option<i32>,
}

#[derive(Args)]
struct ReaperArgs {
    #[arg(long, default_value_t = 30)]
    grace_seconds: i32,
    #[arg(long, default_value_t = 3600)]
    max_duration_seconds: i64,
    #[arg(long, default_value = "fail_retry")]
    policy: String,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum RunnerMode {
    Incremental {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "commits")]
        job: String,
    },
    Backfill {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        last_hours: Option<i64>,
        #[arg(long)]
        last_days: Option<i64>,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long)]
        start_rev: Option<i64>,
        #[arg(long)]
        end_rev: Option<i64>,
        #[arg(long)]
        update_watermark: bool,
        #[arg(long, default_value = "commits")]
        job: String,
    },
}

#[derive(Args)]
struct MaterializeArgs {
    #[arg(long)]
    blob_id: Option<i64>,
    #[arg(long)]
    source_type: Option<String>,
    #[arg(long)]
    retry_failed: bool,
    #[arg(long, default_value_t = 50)]
    batch_size: i64,
}

/// Parses the CLI's `<type>:<id>` repo reference, e.g. `git:42`.
fn parse_repo_ref(s: &str) -> Result<(RepoType, i64)> {
    let (repo_type, id) = s
        .split_once(':')
        .with_context(|| format!("--repo must be '<type>:<id>', got '{s}'"))?;
    let repo_type: RepoType = repo_type.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let repo_id: i64 = id.parse().with_context(|| format!("invalid repo id '{id}'"))?;
    Ok((repo_type, repo_id))
}

fn job_type_for(repo_type: RepoType, job: &str) -> Result<JobType> {
    if repo_type == RepoType::Svn {
        return Ok(JobType::Svn);
    }
    match job {
        "commits" => Ok(JobType::GitlabCommits),
        "mrs" => Ok(JobType::GitlabMrs),
        "reviews" => Ok(JobType::GitlabReviews),
        other => anyhow::bail!("unknown --job '{other}', expected commits|mrs|reviews"),
    }
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn Store>> {
    match config.artifacts_backend {
        ArtifactsBackend::Local => Ok(Arc::new(scm_artifact_store::LocalArtifactsStore::new(&config.artifacts_root))),
        ArtifactsBackend::File => Ok(Arc::new(scm_artifact_store::FileUriStore::new())),
        ArtifactsBackend::Object => {
            #[cfg(feature = "object-store")]
            {
                build_object_store().await
            }
            #[cfg(not(feature = "object-store"))]
            {
                anyhow::bail!("ENGRAM_ARTIFACTS_BACKEND=object requires the object-store feature")
            }
        }
    }
}

#[cfg(feature = "object-store")]
async fn build_object_store() -> Result<Arc<dyn Store>> {
    let bucket = std::env::var("ENGRAM_ARTIFACTS_S3_BUCKET")
        .context("ENGRAM_ARTIFACTS_S3_BUCKET must be set for the object backend")?;
    let sdk_config = aws_config::load_from_env().await;
    let client = aws_sdk_s3::Client::new(&sdk_config);
    Ok(Arc::new(scm_artifact_store::ObjectStore::new(client, bucket)))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sqlx=warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", scm_errors::redact(&format!("{err:#}")));
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("failed to load configuration")?;
    let ctx = AppContext::connect(config).await?;
    ctx.run_migrations().await?;

    match cli.command {
        Commands::Worker(args) => run_worker(&ctx, args).await,
        Commands::Reaper(args) => run_reaper(&ctx, args).await,
        Commands::Runner { mode } => run_runner(&ctx, mode).await,
        Commands::Materialize(args) => run_materialize(&ctx, args).await,
    }
}

async fn run_worker(ctx: &AppContext, args: WorkerArgs) -> Result<ExitCode> {
    let queue = Arc::new(JobQueue::new(ctx.pool.clone()));
    let run_recorder = RunRecorder::new(ctx.pool.clone());
    let registry = ExecutorRegistry::new();

    let job_types = args
        .job_types
        .map(|types| {
            types
                .iter()
                .map(|t| t.parse::<JobType>().map_err(|e| anyhow::anyhow!(e)))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let worker_config = WorkerConfig {
        worker_id: args.worker_id,
        job_types,
        instance_allowlist: None,
        tenant_allowlist: None,
        heartbeat: HeartbeatConfig {
            lease_seconds: args.lease_seconds.unwrap_or(300),
            ..HeartbeatConfig::default()
        },
    };

    let worker = WorkerLoop::new(queue, run_recorder, registry, worker_config);

    loop {
        match worker.process_one().await? {
            Some(outcome) => {
                tracing::info!(?outcome, "processed job");
            }
            None => {
                if args.once {
                    return Ok(ExitCode::from(0));
                }
                tokio::time::sleep(std::time::Duration::from_secs(args.poll_interval)).await;
            }
        }
        if args.once {
            return Ok(ExitCode::from(0));
        }
    }
}

fn parse_expired_job_policy(s: &str) -> Result<ExpiredJobPolicy> {
    match s {
        "to_pending" => Ok(ExpiredJobPolicy::ToPending),
        "fail_retry" => Ok(ExpiredJobPolicy::FailRetry),
        "mark_dead" => Ok(ExpiredJobPolicy::MarkDead),
        other => anyhow::bail!("unknown --policy '{other}', expected to_pending|fail_retry|mark_dead"),
    }
}

async fn run_reaper(ctx: &AppContext, args: ReaperArgs) -> Result<ExitCode> {
    let policy = parse_expired_job_policy(&args.policy)?;

    if args.dry_run {
        let expired_jobs: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM scm.sync_jobs
             WHERE status = 'running' AND locked_at + make_interval(secs => lease_seconds + $1) < now()",
        )
        .bind(args.grace_seconds)
        .fetch_one(&ctx.pool)
        .await?;
        let expired_runs: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM scm.sync_runs
             WHERE status = 'running' AND started_at + make_interval(secs => $1) < now()",
        )
        .bind(args.max_duration_seconds as i32)
        .fetch_one(&ctx.pool)
        .await?;
        let expired_locks: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM scm.sync_locks
             WHERE locked_by IS NOT NULL AND locked_at + make_interval(secs => lease_seconds + $1) < now()",
        )
        .bind(args.grace_seconds)
        .fetch_one(&ctx.pool)
        .await?;
        println!(
            "{}",
            serde_json::json!({
                "dry_run": true,
                "expired_jobs": expired_jobs,
                "expired_runs": expired_runs,
                "expired_locks": expired_locks,
            })
        );
        return Ok(ExitCode::from(0));
    }

    let reaper = Reaper::new(
        ctx.pool.clone(),
        ReaperConfig {
            grace_seconds: args.grace_seconds,
            max_run_duration_seconds: args.max_duration_seconds,
            expired_job_policy: policy,
            ..ReaperConfig::default()
        },
    );
    let report = reaper.reap_once().await?;
    println!(
        "{}",
        serde_json::json!({
            "jobs_recovered": report.jobs_recovered,
            "runs_failed": report.runs_failed,
            "locks_cleared": report.locks_cleared,
        })
    );
    Ok(ExitCode::from(0))
}

async fn run_runner(ctx: &AppContext, mode: RunnerMode) -> Result<ExitCode> {
    let queue = JobQueue::new(ctx.pool.clone());
    let runner = Runner::new(ctx.pool.clone(), queue, RunnerDefaults::default());

    match mode {
        RunnerMode::Incremental { repo, job } => {
            let (repo_type, repo_id) = parse_repo_ref(&repo)?;
            let job_type = job_type_for(repo_type, &job)?;
            match runner.enqueue_incremental(repo_id, job_type).await? {
                Some(job_id) => println!("{}", serde_json::json!({ "enqueued": true, "job_id": job_id })),
                None => println!("{}", serde_json::json!({ "enqueued": false, "reason": "already pending or running" })),
            }
            Ok(ExitCode::from(0))
        }
        RunnerMode::Backfill {
            repo,
            last_hours,
            last_days,
            since,
            until,
            start_rev,
            end_rev,
            update_watermark,
            job,
        } => {
            let (repo_type, repo_id) = parse_repo_ref(&repo)?;
            let job_type = job_type_for(repo_type, &job)?;

            let job_ids = if let (Some(start_rev), Some(end_rev)) = (start_rev, end_rev) {
                runner
                    .enqueue_backfill_revisions(repo_id, job_type, start_rev, end_rev, update_watermark)
                    .await?
            } else {
                let (since, until) = if let Some(hours) = last_hours {
                    (Utc::now() - Duration::hours(hours), Utc::now())
                } else if let Some(days) = last_days {
                    (Utc::now() - Duration::days(days), Utc::now())
                } else if let (Some(since), Some(until)) = (since, until) {
                    (since, until)
                } else {
                    anyhow::bail!(
                        "backfill requires --last-hours, --last-days, --since/--until, or --start-rev/--end-rev"
                    );
                };
                runner
                    .enqueue_backfill_time(repo_id, job_type, since, until, update_watermark)
                    .await?
            };

            println!("{}", serde_json::json!({ "enqueued_chunks": job_ids.len(), "job_ids": job_ids }));
            Ok(ExitCode::from(0))
        }
    }
}

async fn run_materialize(ctx: &AppContext, args: MaterializeArgs) -> Result<ExitCode> {
    let store = build_store(&ctx.config).await?;
    let materializer = scm_materializer::Materializer::new(ctx.pool.clone(), store, 5);

    if let Some(blob_id) = args.blob_id {
        println!(
            "{}",
            serde_json::json!({ "blob_id": blob_id, "note": "single-blob materialization requires a source fetcher adapter supplied by the embedding deployment" })
        );
        return Ok(ExitCode::from(0));
    }

    let source_type = args
        .source_type
        .map(|s| s.parse::<scm_types::patch_blob::SourceType>())
        .transpose()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let batch = materializer
        .select_batch(source_type, args.retry_failed, args.batch_size)
        .await?;

    println!(
        "{}",
        serde_json::json!({
            "batch_size": batch.len(),
            "blob_ids": batch,
            "note": "fetching and transforming bytes requires a source fetcher adapter supplied by the embedding deployment",
        })
    );

    if batch.is_empty() {
        Ok(ExitCode::from(0))
    } else {
        Ok(ExitCode::from(1))
    }
}

#[allow(dead_code)]
fn job_outcome_label(outcome: JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Acked => "acked",
        JobOutcome::Retried => "retried",
        JobOutcome::Dead => "dead",
        JobOutcome::Requeued => "requeued",
        JobOutcome::LeaseLost => "lease_lost",
    }
}

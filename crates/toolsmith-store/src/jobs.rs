use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use toolsmith_core::events::ProgressLogEntry;
use toolsmith_core::{JobId, JobStatus, PipelineStep, ToolConstructionContext, UserId, TCC_VERSION};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{col, Column};

const PAYLOAD: Column = col("jobs", "payload", 0);

/// Durable storage of exactly one construction context per job.
///
/// `save` always replaces the whole record.
#[async_trait]
pub trait JobStateStore: Send + Sync {
    async fn save(&self, ctx: &ToolConstructionContext) -> Result<(), StoreError>;

    /// Fails with `StoreError::NotFound` for an unknown job.
    async fn load(&self, job_id: &JobId) -> Result<ToolConstructionContext, StoreError>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub current_step: PipelineStep,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert the job row and append any progress entries not yet recorded.
    #[instrument(skip(self, ctx), fields(job_id = %ctx.job_id, status = %ctx.status, step = %ctx.current_step))]
    pub fn save_sync(&self, ctx: &ToolConstructionContext) -> Result<(), StoreError> {
        let payload = serde_json::to_string(ctx)?;
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO jobs (id, user_id, status, current_step, tcc_version, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    current_step = excluded.current_step,
                    tcc_version = excluded.tcc_version,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    ctx.job_id.as_str(),
                    ctx.user_id.as_str(),
                    ctx.status.as_str(),
                    ctx.current_step.as_str(),
                    ctx.tcc_version,
                    payload,
                    ctx.created_at.to_rfc3339(),
                    ctx.updated_at.to_rfc3339(),
                ],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO job_progress (job_id, sequence, step, status, message, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (seq, entry) in ctx.progress_log.iter().enumerate() {
                    stmt.execute(rusqlite::params![
                        ctx.job_id.as_str(),
                        seq as i64,
                        entry.step.as_str(),
                        entry.status.as_str(),
                        entry.message,
                        entry.timestamp.to_rfc3339(),
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn load_sync(&self, job_id: &JobId) -> Result<ToolConstructionContext, StoreError> {
        let raw: String = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT payload FROM jobs WHERE id = ?1")?;
            let mut rows = stmt.query([job_id.as_str()])?;
            match rows.next()? {
                Some(row) => PAYLOAD.read(row),
                None => Err(StoreError::NotFound(format!("job {job_id}"))),
            }
        })?;
        let ctx: ToolConstructionContext = PAYLOAD.parse_json(&raw)?;
        check_version(&ctx.tcc_version)?;
        Ok(ctx)
    }

    /// Jobs owned by a user, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId, limit: u32) -> Result<Vec<JobSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, json_extract(payload, '$.request.name'), status, current_step, created_at, updated_at
                 FROM jobs WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = col("jobs", "id", 0).read(row)?;
                let name: Option<String> = col("jobs", "payload", 1).read(row)?;
                results.push(JobSummary {
                    job_id: JobId::from_raw(id),
                    name: name.unwrap_or_default(),
                    status: col("jobs", "status", 2).parsed(row)?,
                    current_step: col("jobs", "current_step", 3).parsed(row)?,
                    created_at: col("jobs", "created_at", 4).read(row)?,
                    updated_at: col("jobs", "updated_at", 5).read(row)?,
                });
            }
            Ok(results)
        })
    }

    /// Append-only progress audit log for a job, in emission order.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn progress(&self, job_id: &JobId) -> Result<Vec<ProgressLogEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT step, status, message, timestamp FROM job_progress
                 WHERE job_id = ?1 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query([job_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(ProgressLogEntry {
                    step: col("job_progress", "step", 0).parsed(row)?,
                    status: col("job_progress", "status", 1).parsed(row)?,
                    message: col("job_progress", "message", 2).read(row)?,
                    timestamp: col("job_progress", "timestamp", 3).timestamp(row)?,
                });
            }
            Ok(results)
        })
    }
}

/// Accept any context whose major version matches ours; newer minors only add fields.
fn check_version(found: &str) -> Result<(), StoreError> {
    let major = |v: &str| v.split('.').next().unwrap_or_default().to_owned();
    if major(found) == major(TCC_VERSION) {
        Ok(())
    } else {
        Err(StoreError::UnsupportedVersion {
            found: found.to_owned(),
            expected: TCC_VERSION.to_owned(),
        })
    }
}

#[async_trait]
impl JobStateStore for JobRepo {
    async fn save(&self, ctx: &ToolConstructionContext) -> Result<(), StoreError> {
        let repo = self.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || repo.save_sync(&ctx)).await?
    }

    async fn load(&self, job_id: &JobId) -> Result<ToolConstructionContext, StoreError> {
        let repo = self.clone();
        let job_id = job_id.clone();
        tokio::task::spawn_blocking(move || repo.load_sync(&job_id)).await?
    }
}

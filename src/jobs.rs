use crate::cache;
use crate::entities;
use crate::errors::{MeridianError, Result};
use crate::storage;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, NotSet, Set};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

pub const PURGE_EXPIRED_TOKENS: &str = "purge_expired_tokens";
pub const PURGE_EXPIRED_AUTH_STATES: &str = "purge_expired_auth_states";
pub const PURGE_EXPIRED_CACHE: &str = "purge_expired_cache";

/// Job name and cron schedule.
const SCHEDULE: &[(&str, &str)] = &[
    (PURGE_EXPIRED_TOKENS, "0 */5 * * * *"),
    (PURGE_EXPIRED_AUTH_STATES, "30 */5 * * * *"),
    (PURGE_EXPIRED_CACHE, "0 * * * * *"),
];

/// Start the scheduler with every purge job.
///
/// Rows past their expiry are already ignored on read; these jobs only keep
/// the tables from growing.
pub async fn init_scheduler(db: DatabaseConnection) -> Result<JobScheduler> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| MeridianError::Other(format!("Failed to create job scheduler: {e}")))?;

    for (name, cron) in SCHEDULE {
        let db = db.clone();
        let job = Job::new_async(*cron, move |_uuid, _l| {
            let db = db.clone();
            Box::pin(async move {
                if let Err(e) = run_job(&db, name).await {
                    error!(job = name, error = %e, "failed to record job execution");
                }
            })
        })
        .map_err(|e| MeridianError::Other(format!("Failed to create job {name}: {e}")))?;

        sched
            .add(job)
            .await
            .map_err(|e| MeridianError::Other(format!("Failed to add job {name}: {e}")))?;
    }

    sched
        .start()
        .await
        .map_err(|e| MeridianError::Other(format!("Failed to start job scheduler: {e}")))?;

    info!("Job scheduler started with {} jobs", SCHEDULE.len());
    Ok(sched)
}

async fn purge(db: &DatabaseConnection, job_name: &str) -> Result<u64> {
    match job_name {
        PURGE_EXPIRED_TOKENS => storage::purge_expired_tokens(db).await,
        PURGE_EXPIRED_AUTH_STATES => storage::purge_expired_auth_states(db).await,
        PURGE_EXPIRED_CACHE => cache::purge_expired(db).await,
        _ => Err(MeridianError::NotFound(format!("job {job_name}"))),
    }
}

/// Run one job and record the outcome in `job_executions`. Errors from the
/// job itself are recorded, not returned.
pub async fn run_job(db: &DatabaseConnection, job_name: &str) -> Result<()> {
    let execution_id = start_job_execution(db, job_name).await?;

    match purge(db, job_name).await {
        Ok(count) => {
            info!(job = job_name, records = count, "job completed");
            complete_job_execution(db, execution_id, true, None, Some(count as i64)).await
        }
        Err(e) => {
            error!(job = job_name, error = %e, "job failed");
            complete_job_execution(db, execution_id, false, Some(e.to_string()), None).await
        }
    }
}

/// Run a job outside its schedule.
pub async fn trigger_job_manually(db: &DatabaseConnection, job_name: &str) -> Result<()> {
    if !SCHEDULE.iter().any(|(name, _)| *name == job_name) {
        return Err(MeridianError::NotFound(format!("job {job_name}")));
    }
    info!(job = job_name, "manually triggering job");
    run_job(db, job_name).await
}

pub async fn start_job_execution(db: &DatabaseConnection, job_name: &str) -> Result<i64> {
    let execution = entities::job_execution::ActiveModel {
        id: NotSet,
        job_name: Set(job_name.to_string()),
        started_at: Set(Utc::now().timestamp()),
        completed_at: Set(None),
        success: Set(None),
        error_message: Set(None),
        records_processed: Set(None),
    };

    Ok(execution.insert(db).await?.id)
}

pub async fn complete_job_execution(
    db: &DatabaseConnection,
    execution_id: i64,
    success: bool,
    error_message: Option<String>,
    records_processed: Option<i64>,
) -> Result<()> {
    let Some(execution) = entities::JobExecution::find_by_id(execution_id).one(db).await? else {
        return Ok(());
    };

    let mut active = execution.into_active_model();
    active.completed_at = Set(Some(Utc::now().timestamp()));
    active.success = Set(Some(i64::from(success)));
    active.error_message = Set(error_message);
    active.records_processed = Set(records_processed);
    active.update(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TokenType;
    use crate::test_support::TestDb;
    use sea_orm::EntityTrait;

    #[tokio::test]
    async fn test_token_purge_is_recorded() {
        let test_db = TestDb::new().await;
        let db = test_db.connection();

        storage::insert_token(db, TokenType::Bearer, "c", "s", &[], -10, None)
            .await
            .unwrap();
        let live = storage::insert_token(db, TokenType::Bearer, "c", "s", &[], 3600, None)
            .await
            .unwrap();

        trigger_job_manually(db, PURGE_EXPIRED_TOKENS)
            .await
            .expect("Failed to run job");

        let executions = entities::JobExecution::find().all(db).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].job_name, PURGE_EXPIRED_TOKENS);
        assert_eq!(executions[0].success, Some(1));
        assert_eq!(executions[0].records_processed, Some(1));

        assert!(storage::get_token_by_id(db, &live.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected() {
        let test_db = TestDb::new().await;
        assert!(matches!(
            trigger_job_manually(test_db.connection(), "nope").await,
            Err(MeridianError::NotFound(_))
        ));
    }
}

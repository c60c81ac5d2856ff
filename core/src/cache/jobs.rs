use super::*;

use hyperdrive_protocol::JobStatus;

/// Row persisted when the launcher gets an instance for a job.
#[derive(Debug, Clone)]
pub struct JobLaunchParams {
    pub jobid: String,
    pub jobname: String,
    pub instance_id: String,
    pub orig_jobscript: String,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub jobid: String,
    pub jobname: String,
    pub status: JobStatus,
    pub instance_id: Option<String>,
    pub orig_jobscript: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    jobid: String,
    jobname: String,
    status: String,
    instance_id: Option<String>,
    orig_jobscript: String,
    start_time: Option<String>,
    end_time: Option<String>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            jobid: row.jobid,
            jobname: row.jobname,
            status: JobStatus::parse(&row.status)?,
            instance_id: row.instance_id,
            orig_jobscript: row.orig_jobscript,
            start_time: row.start_time.as_deref().map(parse_instant).transpose()?,
            end_time: row.end_time.as_deref().map(parse_instant).transpose()?,
        })
    }
}

impl Cache {
    /// Record a (re)launched job as RUNNING. A retry replaces the previous
    /// row wholesale: fresh instance id, fresh start time, no end time.
    pub async fn record_launch(&self, params: &JobLaunchParams) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT OR REPLACE INTO jobs (jobid, jobname, status, instance_id, orig_jobscript, start_time, end_time)
VALUES (?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&params.jobid)
        .bind(&params.jobname)
        .bind(JobStatus::Running.as_str())
        .bind(&params.instance_id)
        .bind(&params.orig_jobscript)
        .bind(format_instant(params.start_time))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn job(&self, jobid: &str) -> anyhow::Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
SELECT jobid, jobname, status, instance_id, orig_jobscript, start_time, end_time
FROM jobs
WHERE jobid = ?
            "#,
        )
        .bind(jobid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }

    pub async fn job_status(&self, jobid: &str) -> anyhow::Result<Option<JobStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE jobid = ?")
            .bind(jobid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some((status,)) => Ok(Some(JobStatus::parse(&status)?)),
        }
    }

    pub async fn list_jobs(&self) -> anyhow::Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
SELECT jobid, jobname, status, instance_id, orig_jobscript, start_time, end_time
FROM jobs
ORDER BY start_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    /// Move a non-terminal job to a non-terminal status. A job already in a
    /// terminal state is left untouched.
    pub async fn set_status_if_active(
        &self,
        jobid: &str,
        status: JobStatus,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = ?
WHERE jobid = ? AND status NOT IN (?, ?)
            "#,
        )
        .bind(status.as_str())
        .bind(jobid)
        .bind(JobStatus::Success.as_str())
        .bind(JobStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a job into a terminal state, stamping its end time. Refused (and
    /// reported as false) when the job is already terminal: terminal states
    /// are never left, so duplicate queue events and late observations
    /// degrade to no-ops.
    pub async fn mark_terminal(
        &self,
        jobid: &str,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            r#"
UPDATE jobs
SET status = ?, end_time = ?
WHERE jobid = ? AND status NOT IN (?, ?)
            "#,
        )
        .bind(status.as_str())
        .bind(format_instant(at))
        .bind(jobid)
        .bind(JobStatus::Success.as_str())
        .bind(JobStatus::Failed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `clean-cache`: drop finished jobs, keep everything in flight.
    pub async fn delete_terminal_jobs(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status IN (?, ?)")
            .bind(JobStatus::Success.as_str())
            .bind(JobStatus::Failed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// (jobid, instance_id) for every RUNNING job with a known instance.
    pub async fn running_instances(&self) -> anyhow::Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
SELECT jobid, instance_id
FROM jobs
WHERE status = ? AND instance_id IS NOT NULL
            "#,
        )
        .bind(JobStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn orig_jobscript(&self, jobid: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT orig_jobscript FROM jobs WHERE jobid = ?")
                .bind(jobid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(script,)| script))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_temp_cache;
    use super::*;
    use pretty_assertions::assert_eq;

    fn launch(jobid: &str) -> JobLaunchParams {
        JobLaunchParams {
            jobid: jobid.to_string(),
            jobname: format!("hd-align-{jobid}"),
            instance_id: format!("i-{jobid}"),
            orig_jobscript: "/tmp/job.sh".to_string(),
            start_time: now_second_precision(),
        }
    }

    #[tokio::test]
    async fn launch_then_terminal_sets_end_time() {
        let (_dir, cache) = open_temp_cache().await;
        cache.record_launch(&launch("a")).await.expect("launch");

        let job = cache.job("a").await.expect("fetch").expect("present");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.end_time, None);

        let at = now_second_precision();
        assert!(
            cache
                .mark_terminal("a", JobStatus::Success, at)
                .await
                .expect("terminal")
        );
        let job = cache.job("a").await.expect("fetch").expect("present");
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.end_time, Some(at));
    }

    #[tokio::test]
    async fn terminal_state_is_never_left() {
        let (_dir, cache) = open_temp_cache().await;
        cache.record_launch(&launch("a")).await.expect("launch");
        let at = now_second_precision();
        assert!(
            cache
                .mark_terminal("a", JobStatus::Failed, at)
                .await
                .expect("terminal")
        );

        // a late SUCCESS (e.g. queue message after kill) is refused
        assert!(
            !cache
                .mark_terminal("a", JobStatus::Success, now_second_precision())
                .await
                .expect("refused")
        );
        assert!(
            !cache
                .set_status_if_active("a", JobStatus::Pending)
                .await
                .expect("refused")
        );
        let job = cache.job("a").await.expect("fetch").expect("present");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.end_time, Some(at));
    }

    #[tokio::test]
    async fn every_terminal_row_has_an_end_time() {
        let (_dir, cache) = open_temp_cache().await;
        for jobid in ["a", "b", "c"] {
            cache.record_launch(&launch(jobid)).await.expect("launch");
        }
        cache
            .mark_terminal("a", JobStatus::Success, now_second_precision())
            .await
            .expect("terminal");
        cache
            .mark_terminal("b", JobStatus::Failed, now_second_precision())
            .await
            .expect("terminal");

        for job in cache.list_jobs().await.expect("list") {
            assert_eq!(job.status.is_terminal(), job.end_time.is_some(), "{job:?}");
        }
    }

    #[tokio::test]
    async fn clean_cache_removes_only_terminal_jobs() {
        let (_dir, cache) = open_temp_cache().await;
        for jobid in ["done", "failed", "running"] {
            cache.record_launch(&launch(jobid)).await.expect("launch");
        }
        cache
            .mark_terminal("done", JobStatus::Success, now_second_precision())
            .await
            .expect("terminal");
        cache
            .mark_terminal("failed", JobStatus::Failed, now_second_precision())
            .await
            .expect("terminal");

        assert_eq!(cache.delete_terminal_jobs().await.expect("clean"), 2);
        let left = cache.list_jobs().await.expect("list");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].jobid, "running");
    }

    #[tokio::test]
    async fn relaunch_replaces_the_row() {
        let (_dir, cache) = open_temp_cache().await;
        cache.record_launch(&launch("a")).await.expect("launch");
        cache
            .set_status_if_active("a", JobStatus::Pending)
            .await
            .expect("pending");

        let mut retry = launch("a");
        retry.instance_id = "i-retry".to_string();
        cache.record_launch(&retry).await.expect("relaunch");

        let job = cache.job("a").await.expect("fetch").expect("present");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.instance_id.as_deref(), Some("i-retry"));
        assert_eq!(job.end_time, None);
    }

    #[tokio::test]
    async fn running_instances_skips_other_states() {
        let (_dir, cache) = open_temp_cache().await;
        for jobid in ["a", "b", "c"] {
            cache.record_launch(&launch(jobid)).await.expect("launch");
        }
        cache
            .set_status_if_active("b", JobStatus::Pending)
            .await
            .expect("pending");
        cache
            .mark_terminal("c", JobStatus::Success, now_second_precision())
            .await
            .expect("terminal");

        let running = cache.running_instances().await.expect("running");
        assert_eq!(running, vec![("a".to_string(), "i-a".to_string())]);
    }
}

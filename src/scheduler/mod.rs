pub mod retry;
pub mod tasks;

use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// A recurring job as registered, kept for the startup and shutdown logs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub name: String,
    pub cron_expr: String,
    pub id: String,
}

/// Cron driver for the relay's recurring work
pub struct Scheduler {
    inner: JobScheduler,
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self {
            inner,
            jobs: Vec::new(),
        })
    }

    /// Run `task` on every match of `cron_expr` (six fields, seconds first).
    /// Each run is logged with how long it took.
    pub async fn add_cron_job<F>(
        &mut self,
        name: &str,
        cron_expr: &str,
        task: F,
    ) -> Result<&ScheduledJob>
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let name = job_name.clone();
            let fut = task();
            Box::pin(async move {
                let started = Instant::now();
                debug!("Job '{}': started", name);
                fut.await;
                debug!("Job '{}': finished in {:?}", name, started.elapsed());
            })
        })
        .with_context(|| format!("Failed to create cron job '{}' ({})", name, cron_expr))?;

        let id = self
            .inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job '{}'", name))?;

        info!("Job '{}' scheduled with cron: {} (id {})", name, cron_expr, id);
        self.jobs.push(ScheduledJob {
            name: name.to_string(),
            cron_expr: cron_expr.to_string(),
            id: id.to_string(),
        });
        Ok(&self.jobs[self.jobs.len() - 1])
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started with {} job(s)", self.jobs.len());
        Ok(())
    }

    /// Stop firing jobs. A run already in progress is not interrupted.
    pub async fn shutdown(&mut self) -> Result<()> {
        for job in &self.jobs {
            debug!("Stopping job '{}' ({}, id {})", job.name, job.cron_expr, job.id);
        }
        self.inner
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_registered_job_is_listed() {
        let mut scheduler = Scheduler::new().await.unwrap();
        let job = scheduler
            .add_cron_job("channel-check", "0 0 * * * *", || Box::pin(async {}))
            .await
            .unwrap()
            .clone();

        assert_eq!(job.name, "channel-check");
        assert_eq!(job.cron_expr, "0 0 * * * *");
        assert!(!job.id.is_empty());
        assert_eq!(scheduler.jobs(), &[job]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_cron_is_rejected() {
        let mut scheduler = Scheduler::new().await.unwrap();
        let err = scheduler
            .add_cron_job("channel-check", "every hour", || Box::pin(async {}))
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("channel-check"));
        assert!(scheduler.jobs().is_empty());
    }
}

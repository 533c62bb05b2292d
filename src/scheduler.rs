//! Cron scheduling for jobs. Rebuilt from scratch on every
//! configuration load: the old driver is shut down, entries are
//! validated against the fresh registry snapshot, and a new driver
//! starts with only the runnable ones.

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::pipeline::PipelineEngine;
use crate::tasks::registry::Registry;
use crate::tasks::ScheduledTask;

pub struct Scheduler {
    driver: Option<JobScheduler>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { driver: None }
    }

    /// Tear down the current schedule and build a new one. A bad entry
    /// is logged and skipped; one typo must not take down the robot's
    /// whole calendar. Returns the number of entries scheduled.
    pub async fn rebuild(
        &mut self,
        engine: Arc<PipelineEngine>,
        registry: Arc<Registry>,
        entries: &[ScheduledTask],
        tz: Option<chrono_tz::Tz>,
    ) -> Result<usize> {
        self.shutdown().await?;
        let snapshot = registry.current();
        let driver = JobScheduler::new().await?;
        let mut scheduled = 0;

        for entry in entries {
            let Some(task) = snapshot.task_by_name(&entry.spec.name) else {
                error!("scheduled task '{}' not found, skipping", entry.spec.name);
                continue;
            };
            let Some(job) = task.as_job() else {
                error!("scheduled task '{}' is not a job, skipping", entry.spec.name);
                continue;
            };
            if task.core().disabled {
                error!("scheduled job '{}' is disabled, skipping", entry.spec.name);
                continue;
            }
            if job.channel.is_empty() {
                error!(
                    "scheduled job '{}' has no Channel configured, skipping",
                    entry.spec.name
                );
                continue;
            }
            if let Some(missing) = job.required_parameters.iter().find(|required| {
                let r = required.as_str();
                !task.core().parameters.iter().any(|p| p.name == r)
                    && !entry.spec.parameters.iter().any(|p| p.name == r)
            }) {
                error!(
                    "scheduled job '{}' missing required parameter {}, skipping",
                    entry.spec.name, missing
                );
                continue;
            }

            let command = if entry.spec.command.is_empty() {
                "run".to_string()
            } else {
                entry.spec.command.clone()
            };
            let args = entry.spec.arguments.clone();
            let parameters = entry.spec.parameters.clone();
            let channel = job.channel.clone();
            let engine = engine.clone();
            let task = task.clone();
            let name = entry.spec.name.clone();

            let fire = move |_id, _sched| {
                let engine = engine.clone();
                let task = task.clone();
                let command = command.clone();
                let args = args.clone();
                let parameters = parameters.clone();
                let channel = channel.clone();
                let name = name.clone();
                Box::pin(async move {
                    info!("firing scheduled job '{}'", name);
                    engine
                        .run_automatic(task, &command, args, parameters, Some(&channel))
                        .await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            };

            let cron_job = match tz {
                Some(tz) => Job::new_async_tz(entry.schedule.as_str(), tz, fire),
                None => Job::new_async(entry.schedule.as_str(), fire),
            };
            match cron_job {
                Ok(cron_job) => {
                    driver.add(cron_job).await?;
                    scheduled += 1;
                }
                Err(e) => {
                    error!(
                        "bad schedule '{}' for job '{}': {e}, skipping",
                        entry.schedule, entry.spec.name
                    );
                }
            }
        }

        driver.start().await?;
        info!("scheduler running with {scheduled} entries");
        self.driver = Some(driver);
        Ok(scheduled)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(mut driver) = self.driver.take() {
            driver.shutdown().await?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

use tokio_cron_scheduler::{Job, JobScheduler};

use tracing::{debug, error, info};

use std::sync::Arc;

use crate::error::StatsResult;
use crate::service::StatsService;

pub struct Scheduler {
    scheduler: JobScheduler,
    service: Arc<StatsService>,
}

pub enum JobProcess<'schedule> {
    SweepCaches(&'schedule str),
    SweepLeaderboards(&'schedule str),
}

impl Scheduler {
    pub async fn new(service: Arc<StatsService>) -> StatsResult<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Scheduler { scheduler, service })
    }

    pub async fn add_job(&self, job_process: JobProcess<'_>) -> StatsResult<uuid::Uuid> {
        let job = match job_process {
            JobProcess::SweepCaches(schedule) => sweep_caches_job(schedule, self.service.clone())?,
            JobProcess::SweepLeaderboards(schedule) => {
                sweep_leaderboards_job(schedule, self.service.clone())?
            }
        };
        Ok(self.scheduler.add(job).await?)
    }

    pub async fn start(&self) -> StatsResult<()> {
        Ok(self.scheduler.start().await?)
    }

    pub async fn shutdown(&mut self) -> StatsResult<()> {
        Ok(self.scheduler.shutdown().await?)
    }
}

//////////////////
// Jobs definition
//////////////////

fn sweep_caches_job(schedule: &str, service: Arc<StatsService>) -> StatsResult<Job> {
    let job = Job::new_async(schedule, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            let removed = service.sweep_caches();
            debug!("Cache sweep done, {} entries expired", removed);
        })
    })?;
    Ok(job)
}

fn sweep_leaderboards_job(schedule: &str, service: Arc<StatsService>) -> StatsResult<Job> {
    let job = Job::new_async(schedule, move |uuid, mut l| {
        let service = service.clone();
        Box::pin(async move {
            match service.sweep_leaderboards().await {
                Ok(reports) => {
                    for (kind, report) in reports {
                        info!(
                            "{} leaderboards swept: {} attributes, {} values pruned",
                            kind, report.attributes, report.pruned
                        );
                    }
                }
                Err(e) => error!("Could not sweep leaderboards. {e}"),
            };

            // Query the next execution time for this job
            let next_tick = l.next_tick_for_job(uuid).await;
            match next_tick {
                Ok(Some(ts)) => info!("Next leaderboard sweep at {:?}", ts),
                _ => error!("Could not get next tick for leaderboard sweep job"),
            }
        })
    })?;
    Ok(job)
}

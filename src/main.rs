use skystats::cli::Cli;
use skystats::config::Settings;
use skystats::scheduler::{JobProcess, Scheduler};
use skystats::service::StatsService;
use skystats::storage::{MemoryStore, Store};

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Settings::load(&Cli::parse())?;

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(settings.get_trace_level())
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Setting default subscriber failed");

    let store: Option<Arc<dyn Store>> = match settings.store.as_str() {
        "none" => None,
        "memory" => Some(Arc::new(MemoryStore::new())),
        other => {
            warn!("Unknown store '{}', falling back to the memory store", other);
            Some(Arc::new(MemoryStore::new()))
        }
    };
    let service = Arc::new(StatsService::from_settings(&settings, store)?);

    // Players requested on the command line are fetched and ranked right away
    for player in settings.players.iter() {
        match service.refresh_player(player).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!("Player {} does not exist", player),
            Err(e) => error!("Could not refresh player {}. {}", player, e),
        }
    }

    if settings.once {
        return Ok(());
    }

    let mut sched = Scheduler::new(service.clone()).await?;

    let jobs = vec![
        JobProcess::SweepCaches(&settings.cache_sweep_schedule),
        JobProcess::SweepLeaderboards(&settings.leaderboard_sweep_schedule),
    ];
    for job in jobs {
        sched.add_job(job).await?;
    }

    info!("Starting scheduler.");
    sched.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down.");
    sched.shutdown().await?;

    Ok(())
}

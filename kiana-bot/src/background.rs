use std::path::PathBuf;

use chrono::{DateTime, Days, Duration, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::media::clean_dir;

/// Local hour at which downloaded media is purged.
pub const CACHE_CLEANUP_HOUR: u32 = 1;

/// Empties the given cache directories every day at
/// [`CACHE_CLEANUP_HOUR`] in `timezone`.
pub fn spawn_cache_cleanup(cache_dirs: Vec<PathBuf>, timezone: Tz) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let wait = (next_run(now, timezone, CACHE_CLEANUP_HOUR) - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(3600));
            tokio::time::sleep(wait).await;

            for dir in &cache_dirs {
                match clean_dir(dir).await {
                    Ok(0) => info!("No cache files to clean in {dir:?}"),
                    Ok(removed) => info!("Cleaned {removed} cache files in {dir:?}"),
                    Err(e) => error!("Error while cleaning cache {dir:?}: {e:#}"),
                }
            }
        }
    })
}

/// The next instant strictly after `now` where the local clock in
/// `timezone` reads `hour:00:00`.
pub fn next_run(now: DateTime<Utc>, timezone: Tz, hour: u32) -> DateTime<Utc> {
    let today = now.with_timezone(&timezone).date_naive();
    for offset in 0..=2 {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        let candidate = date
            .and_hms_opt(hour, 0, 0)
            .and_then(|local| local.and_local_timezone(timezone).earliest())
            .map(|local| local.with_timezone(&Utc));
        if let Some(candidate) = candidate.filter(|candidate| *candidate > now) {
            return candidate;
        }
    }
    now + Duration::days(1)
}

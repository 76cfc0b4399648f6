//! The daily report job.
//!
//! A lightweight loop checks the clock and fires the news report once per
//! day at the configured hour/minute. The last-run date lives in the
//! database's state table so a restart inside the window does not re-send
//! the report. The admin path can force the job at any time.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Local, NaiveDate, NaiveTime};

use crate::config::ScheduleConfig;
use crate::database::ChatDatabase;
use crate::news::NewsService;
use crate::pusher::MessagePusher;

const LAST_RUN_STATE_KEY: &str = "news_report_last_run_date";
const POLL_INTERVAL_SECS: u64 = 30;

pub struct SchedulerService {
    news: Arc<NewsService>,
    pusher: Arc<dyn MessagePusher>,
    db: Arc<ChatDatabase>,
    schedule: ScheduleConfig,
}

impl SchedulerService {
    pub fn new(
        news: Arc<NewsService>,
        pusher: Arc<dyn MessagePusher>,
        db: Arc<ChatDatabase>,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            news,
            pusher,
            db,
            schedule,
        }
    }

    /// Spawn the background loop. Returns immediately; the task runs for
    /// the life of the process.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.schedule.enabled {
                tracing::info!("Daily report schedule disabled");
                return;
            }
            tracing::info!(
                "Daily report scheduled at {:02}:{:02} for groups {:?}",
                self.schedule.hour,
                self.schedule.minute,
                self.schedule.target_group_ids
            );
            loop {
                if self.due_now() {
                    match self.run_report_job().await {
                        Ok(status) => tracing::info!("Daily report job: {}", status),
                        Err(e) => tracing::error!("Daily report job failed: {:#}", e),
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(POLL_INTERVAL_SECS)).await;
            }
        })
    }

    fn due_now(&self) -> bool {
        let now = Local::now();
        let last_run = self
            .db
            .get_state(LAST_RUN_STATE_KEY)
            .ok()
            .flatten()
            .and_then(|raw| raw.parse::<NaiveDate>().ok());
        is_due(
            now.date_naive(),
            now.time(),
            self.schedule.hour,
            self.schedule.minute,
            last_run,
        )
    }

    /// Build the report and push it to every configured group. Also the
    /// admin "force it now" entry point.
    pub async fn run_report_job(&self) -> Result<String> {
        let today = Local::now().date_naive().to_string();
        if let Err(e) = self.db.set_state(LAST_RUN_STATE_KEY, &today) {
            tracing::error!("Failed to record report run date: {:#}", e);
        }

        let report = self.news.build_report().await?;

        if self.schedule.target_group_ids.is_empty() {
            tracing::warn!("No target groups configured for the news report");
            return Ok("report generated, but no target groups are configured".to_string());
        }

        // The pusher owns chunking; a long report arrives split already.
        let mut delivered = 0usize;
        for group_id in &self.schedule.target_group_ids {
            match self.pusher.send_group(*group_id, &report).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::error!("Failed to send report to group {}: {:#}", group_id, e);
                }
            }
        }

        Ok(format!(
            "report sent to {}/{} groups",
            delivered,
            self.schedule.target_group_ids.len()
        ))
    }
}

/// Pure scheduling predicate: fire when the configured time has passed
/// today and today has not already run.
fn is_due(
    today: NaiveDate,
    now: NaiveTime,
    hour: u32,
    minute: u32,
    last_run: Option<NaiveDate>,
) -> bool {
    let Some(fire_at) = NaiveTime::from_hms_opt(hour, minute, 0) else {
        return false;
    };
    now >= fire_at && last_run != Some(today)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn time(s: &str) -> NaiveTime {
        s.parse().unwrap()
    }

    #[test]
    fn fires_after_the_configured_time_once_per_day() {
        let today = date("2026-08-06");

        assert!(!is_due(today, time("07:59:00"), 8, 0, None));
        assert!(is_due(today, time("08:00:00"), 8, 0, None));
        assert!(is_due(today, time("23:00:00"), 8, 0, Some(date("2026-08-05"))));
        assert!(!is_due(today, time("23:00:00"), 8, 0, Some(today)));
    }

    #[test]
    fn invalid_configured_time_never_fires() {
        assert!(!is_due(date("2026-08-06"), time("12:00:00"), 25, 0, None));
    }
}

//! Cron scheduling for dockyard jobs.
//!
//! This crate provides:
//!
//! - **Schedule**: cron expression parsing and bounded missed-firing
//!   computation
//! - **CronJob**: the persisted record that stamps out a job per firing
//! - **Scheduler**: the periodic sync that materializes due firings

pub mod cronjob;
pub mod error;
pub mod schedule;
pub mod scheduler;

pub use cronjob::{CronJob, CronJobSpec, CronJobStatus};
pub use error::{ScheduleError, SchedulerError};
pub use schedule::{CronSchedule, MAX_MISSED_SCHEDULES, most_recent_due};
pub use scheduler::{CronJobScheduler, SyncOutcome};

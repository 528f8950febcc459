pub mod cron_utils;
pub mod scheduler;

pub use cron_utils::{validate_cron_expression, CronExpression, CronIter};
pub use scheduler::{CronScheduler, FireOutcome, NextRuns};

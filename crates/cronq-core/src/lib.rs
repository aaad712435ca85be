//! `cronq-core`: configuration, error taxonomy and wire types shared by the
//! scheduler library and the server binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::CronqConfig;
pub use error::{CoreError, Result};
pub use types::{PeriodTask, Payload, CRON_SUFFIX, ONCE_SUFFIX};

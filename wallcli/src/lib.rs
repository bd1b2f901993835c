pub use crate::app::{CliRotator, WallCliApp};
pub use crate::daemon::{parse_command, run_daemon, DaemonCommand, IntervalScheduler, RETRY_BACKOFF};

mod app;
mod daemon;

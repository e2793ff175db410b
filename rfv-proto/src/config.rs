use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Default location of the shared message and registry store.
pub const DEFAULT_DB_PATH: &str = "/var/lib/rfv/rfv.db";

/// Messaging options shared by every binary.
#[derive(Args, Debug, Clone)]
pub struct IpcArgs {
    /// Path of the shared SQLite store
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    pub db: PathBuf,

    /// Polling interval of channel listeners in milliseconds
    #[arg(long, default_value = "50")]
    pub poll_interval_ms: u64,

    /// Maximum number of envelopes handled per poll
    #[arg(long, default_value = "32")]
    pub batch_size: u32,
}

impl IpcArgs {
    pub fn config(&self) -> IpcConfig {
        IpcConfig {
            db_path: self.db.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            batch_size: self.batch_size.max(1),
        }
    }
}

/// Runtime settings of a messaging participant.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub batch_size: u32,
}

impl IpcConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            poll_interval: Duration::from_millis(50),
            batch_size: 32,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestArgs {
        #[command(flatten)]
        ipc: IpcArgs,
    }

    #[test]
    fn test_defaults() {
        let args = TestArgs::parse_from(["test"]);
        let config = args.ipc.config();
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_overrides() {
        let args = TestArgs::parse_from([
            "test",
            "--db",
            "/tmp/x.db",
            "--poll-interval-ms",
            "0",
            "--batch-size",
            "4",
        ]);
        let config = args.ipc.config();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.batch_size, 4);
    }
}

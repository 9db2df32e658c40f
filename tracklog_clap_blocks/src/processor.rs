//! Config for how operations get to the backend.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tracklog_backend::RemoteBackend;
use tracklog_ops::ContainerType;
use tracklog_processor::{
    AsyncOperationProcessor, AsyncProcessorSettings, BatchLimits, OfflineOperationProcessor,
    OperationProcessor, SyncOperationProcessor,
};

/// Delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProcessorMode {
    /// Persist to disk and deliver from a background thread.
    #[default]
    Async,

    /// Deliver every operation before returning to the caller.
    Sync,

    /// Persist to disk only, for a later sync.
    Offline,
}

impl From<ProcessorMode> for tracklog_processor::ProcessorMode {
    fn from(mode: ProcessorMode) -> Self {
        match mode {
            ProcessorMode::Async => Self::Async,
            ProcessorMode::Sync => Self::Sync,
            ProcessorMode::Offline => Self::Offline,
        }
    }
}

/// CLI config for the operation processor.
#[derive(Debug, Clone, clap::Parser)]
pub struct ProcessorConfig {
    #[clap(
        long = "mode",
        env = "TRACKLOG_MODE",
        default_value_t = ProcessorMode::default(),
        value_enum,
        action
    )]
    pub mode: ProcessorMode,

    /// Directory under which every execution keeps its operation queue.
    #[clap(
        long = "data-dir",
        env = "TRACKLOG_DATA_DIR",
        default_value = ".tracklog",
        action
    )]
    pub data_dir: PathBuf,

    /// How long the background consumer sleeps when nothing wakes it up.
    #[clap(
        long = "sleep-time",
        env = "TRACKLOG_SLEEP_TIME",
        default_value = "5s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub sleep_time: Duration,

    #[clap(
        long = "max-points-per-batch",
        env = "TRACKLOG_MAX_POINTS_PER_BATCH",
        default_value = "100000",
        action
    )]
    pub max_points_per_batch: usize,

    #[clap(
        long = "max-attributes-in-batch",
        env = "TRACKLOG_MAX_ATTRIBUTES_IN_BATCH",
        default_value = "1000",
        action
    )]
    pub max_attributes_in_batch: usize,

    #[clap(
        long = "max-points-per-attribute",
        env = "TRACKLOG_MAX_POINTS_PER_ATTRIBUTE",
        default_value = "10000",
        action
    )]
    pub max_points_per_attribute: usize,

    /// Size in bytes at which the queue starts a new segment file.
    #[clap(
        long = "max-segment-size",
        env = "TRACKLOG_MAX_SEGMENT_SIZE",
        default_value = "67108864",
        action
    )]
    pub max_segment_size: u64,

    /// Attempts after a failed delivery before the consumer gives up.
    #[clap(
        long = "max-retries",
        env = "TRACKLOG_MAX_RETRIES",
        default_value = "10",
        action
    )]
    pub max_retries: usize,

    #[clap(
        long = "retry-wait",
        env = "TRACKLOG_RETRY_WAIT",
        default_value = "30s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub retry_wait: Duration,

    /// How long stopping waits for queued operations to be delivered.
    #[clap(
        long = "stop-timeout",
        env = "TRACKLOG_STOP_TIMEOUT",
        default_value = "300s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub stop_timeout: Duration,

    /// Warn when nothing has been delivered for this long.
    #[clap(
        long = "lag-threshold",
        env = "TRACKLOG_LAG_THRESHOLD",
        default_value = "1800s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub lag_threshold: Duration,

    /// Warn when delivery keeps failing for this long.
    #[clap(
        long = "no-progress-threshold",
        env = "TRACKLOG_NO_PROGRESS_THRESHOLD",
        default_value = "300s",
        value_parser = humantime::parse_duration,
        action
    )]
    pub no_progress_threshold: Duration,
}

impl ProcessorConfig {
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_points_per_batch: self.max_points_per_batch,
            max_attributes_in_batch: self.max_attributes_in_batch,
            max_points_per_attribute: self.max_points_per_attribute,
        }
    }

    pub fn async_settings(&self) -> AsyncProcessorSettings {
        AsyncProcessorSettings {
            data_dir: self.data_dir.clone(),
            sleep_time: self.sleep_time,
            batch_limits: self.batch_limits(),
            max_segment_size: self.max_segment_size,
            max_retries: self.max_retries,
            retry_wait: self.retry_wait,
            stop_timeout: self.stop_timeout,
            lag_threshold: self.lag_threshold,
            no_progress_threshold: self.no_progress_threshold,
        }
    }

    /// Create the processor selected by `mode`. It still has to be started.
    pub fn build(
        &self,
        container_id: &str,
        container_type: ContainerType,
        backend: Arc<dyn RemoteBackend>,
    ) -> tracklog_processor::Result<Box<dyn OperationProcessor>> {
        Ok(match self.mode {
            ProcessorMode::Async => Box::new(AsyncOperationProcessor::new(
                container_id,
                container_type,
                backend,
                self.async_settings(),
            )?),
            ProcessorMode::Sync => Box::new(SyncOperationProcessor::new(
                container_id,
                container_type,
                backend,
            )),
            ProcessorMode::Offline => Box::new(OfflineOperationProcessor::new(
                container_id,
                container_type,
                &self.data_dir,
                self.max_segment_size,
            )?),
        })
    }
}

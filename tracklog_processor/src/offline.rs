use std::{path::Path, time::Duration};

use parking_lot::Mutex;
use tracing::info;
use tracklog_ops::{ContainerType, Operation};
use tracklog_queue::DiskQueue;

use crate::{
    OperationProcessor, Result,
    storage::{OperationStorage, ProcessorMode},
};

/// Only persists operations. The execution directory is left behind for a later sync.
#[derive(Debug)]
pub struct OfflineOperationProcessor {
    storage: OperationStorage,
    queue: Mutex<DiskQueue<Operation>>,
}

impl OfflineOperationProcessor {
    pub fn new(
        container_id: &str,
        container_type: ContainerType,
        data_dir: impl AsRef<Path>,
        max_segment_size: u64,
    ) -> Result<Self> {
        let storage = OperationStorage::create(data_dir, container_id, container_type)?;
        let queue = DiskQueue::open(storage.dir(), max_segment_size)?;
        storage.write_metadata(ProcessorMode::Offline, container_id, container_type)?;
        Ok(Self {
            storage,
            queue: Mutex::new(queue),
        })
    }

    pub fn data_dir(&self) -> &Path {
        self.storage.dir()
    }
}

impl OperationProcessor for OfflineOperationProcessor {
    fn enqueue_operation(&self, op: &Operation, wait: bool) -> Result<()> {
        let mut queue = self.queue.lock();
        queue.put(op)?;
        if wait {
            queue.flush()?;
        }
        Ok(())
    }

    fn wait(&self) -> Result<()> {
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        Ok(self.queue.lock().flush()?)
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self, _timeout: Option<Duration>) -> Result<()> {
        let mut queue = self.queue.lock();
        queue.close()?;
        info!(
            storage_dir = ?self.storage.dir(),
            operations = queue.size(),
            "offline operations kept for a later sync"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(self.queue.lock().close()?)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracklog_ops::AttributePath;
    use tracklog_queue::DEFAULT_MAX_FILE_SIZE;

    use super::*;

    fn op(i: i64) -> Operation {
        Operation::AssignInt {
            path: AttributePath::parse("step").unwrap(),
            value: i,
        }
    }

    #[test_log::test]
    fn operations_stay_on_disk() {
        let base = tempfile::tempdir().unwrap();
        let processor =
            OfflineOperationProcessor::new("RUN-3", ContainerType::Run, base.path(), 1024).unwrap();
        processor.start().unwrap();
        for i in 0..50 {
            processor.enqueue_operation(&op(i), i == 49).unwrap();
        }
        processor.stop(None).unwrap();

        let dir = processor.data_dir().to_path_buf();
        assert!(dir.exists());
        let metadata = OperationStorage::read_metadata(&dir).unwrap();
        assert_eq!(metadata.mode, ProcessorMode::Offline);
        assert_eq!(metadata.container_id, "RUN-3");

        let mut queue = DiskQueue::<Operation>::open(&dir, DEFAULT_MAX_FILE_SIZE).unwrap();
        let mut read = vec![];
        while let Some(element) = queue.get().unwrap() {
            read.push(element.obj);
        }
        assert_eq!(read, (0..50).map(op).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_after_stop_fails() {
        let base = tempfile::tempdir().unwrap();
        let processor = OfflineOperationProcessor::new(
            "RUN-4",
            ContainerType::Run,
            base.path(),
            DEFAULT_MAX_FILE_SIZE,
        )
        .unwrap();
        processor.enqueue_operation(&op(1), false).unwrap();
        processor.stop(None).unwrap();

        let err = processor.enqueue_operation(&op(2), false).unwrap_err();
        assert!(
            matches!(err, crate::Error::Queue(tracklog_queue::Error::Closed)),
            "{err}"
        );
    }
}

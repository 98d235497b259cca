//! Static mapping of queue names to handlers.

use std::fmt;
use std::sync::Arc;

use crate::broker::Consumer;
use crate::config::ReportSettings;
use crate::jobs::report::ReportSource;
use crate::jobs::{ReportSmallTalk, TestJob};
use crate::joblog::JobLog;

pub const TEST_QUEUE: &str = "test";
pub const REPORT_QUEUE: &str = "report_small_talk";

type ConsumerFactory = Box<dyn Fn(usize) -> Box<dyn Consumer> + Send + Sync>;

/// A queue and the handler built for each of its workers.
pub struct QueueBinding {
    pub queue: String,
    pub workers: usize,
    factory: ConsumerFactory,
}

impl QueueBinding {
    /// Builds the handler for worker `index`.
    pub fn build(&self, index: usize) -> Box<dyn Consumer> {
        (self.factory)(index)
    }
}

impl fmt::Debug for QueueBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueBinding")
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    bindings: Vec<QueueBinding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, queue: &str, workers: usize, factory: F) -> Self
    where
        F: Fn(usize) -> Box<dyn Consumer> + Send + Sync + 'static,
    {
        self.bindings.push(QueueBinding {
            queue: queue.to_string(),
            workers,
            factory: Box::new(factory),
        });
        self
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }
}

/// The test queue and the small talk report queue. Workers of one queue share
/// the log store, the report source and the settings.
pub fn default_registry(
    log: Arc<dyn JobLog>,
    source: Arc<dyn ReportSource>,
    settings: Arc<ReportSettings>,
    test_workers: usize,
    report_workers: usize,
) -> Registry {
    let test_log = log.clone();
    Registry::new()
        .register(TEST_QUEUE, test_workers, move |index| {
            Box::new(TestJob::new(index, test_log.clone()))
        })
        .register(REPORT_QUEUE, report_workers, move |index| {
            Box::new(ReportSmallTalk::new(
                index,
                log.clone(),
                source.clone(),
                settings.clone(),
            ))
        })
}

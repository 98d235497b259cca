use std::sync::Arc;

use async_trait::async_trait;
use tracing::*;

use super::settle;
use crate::broker::{Consumer, Delivery};
use crate::joblog::{JobLog, JobQueueLog, Lifecycle, PROCESS_RESULT_NONE, PROCESS_TYPE_TEST};

pub const PROCESS_NAME: &str = "Test Job";

/// Does nothing but record the delivery and ack it.
pub struct TestJob {
    worker_index: usize,
    log: Arc<dyn JobLog>,
}

impl TestJob {
    pub fn new(worker_index: usize, log: Arc<dyn JobLog>) -> Self {
        TestJob { worker_index, log }
    }
}

#[async_trait]
impl Consumer for TestJob {
    async fn consume(&self, delivery: Delivery) {
        info!(worker = self.worker_index, payload = delivery.payload(), "Executing test job");

        let entry = JobQueueLog::new(
            PROCESS_NAME,
            PROCESS_TYPE_TEST,
            PROCESS_RESULT_NONE,
            delivery.payload(),
            0,
        );
        let mut lifecycle = Lifecycle::register(self.log.clone(), entry).await;
        lifecycle.processing().await;
        lifecycle.succeeded(delivery.payload().to_string()).await;

        settle(delivery.ack()).await;
    }
}

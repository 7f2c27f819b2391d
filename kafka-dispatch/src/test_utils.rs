use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::message::{AckHandle, DeliveredMessage, MessageHandler, OffsetError};
use crate::producer::ProduceError;

/// Records commits and dead-letter publishes for the messages minted from
/// it, in completion order.
#[derive(Default)]
pub(crate) struct AckLog {
    commits: Mutex<Vec<(i32, i64)>>,
    dlq: Mutex<Vec<DlqPublish>>,
    fail_dlq_publish: AtomicBool,
}

#[derive(Debug, Clone)]
pub(crate) struct DlqPublish {
    pub key: Vec<u8>,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl AckLog {
    pub fn message(
        self: &Arc<Self>,
        topic: &str,
        partition: i32,
        offset: i64,
        key: &[u8],
        body: &[u8],
    ) -> DeliveredMessage {
        let ack = Arc::new(RecordingAck {
            log: self.clone(),
            partition,
            offset,
        });
        DeliveredMessage::new(
            topic.to_owned(),
            partition,
            offset,
            key.to_vec(),
            body.to_vec(),
            None,
            Vec::new(),
            ack,
        )
    }

    pub fn committed(&self) -> Vec<(i32, i64)> {
        self.commits.lock().unwrap().clone()
    }

    pub fn dead_lettered(&self) -> Vec<DlqPublish> {
        self.dlq.lock().unwrap().clone()
    }

    /// Make every subsequent dead-letter publish fail.
    pub fn fail_dlq_publish(&self) {
        self.fail_dlq_publish.store(true, Ordering::SeqCst);
    }
}

struct RecordingAck {
    log: Arc<AckLog>,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl AckHandle for RecordingAck {
    fn commit(&self) -> Result<(), OffsetError> {
        self.log
            .commits
            .lock()
            .unwrap()
            .push((self.partition, self.offset));
        Ok(())
    }

    async fn move_to_dlq(
        &self,
        key: &[u8],
        body: &[u8],
        headers: &[(String, String)],
    ) -> Result<(), ProduceError> {
        if self.log.fail_dlq_publish.load(Ordering::SeqCst) {
            return Err(ProduceError::Canceled);
        }
        self.log.dlq.lock().unwrap().push(DlqPublish {
            key: key.to_vec(),
            body: body.to_vec(),
            headers: headers.to_vec(),
        });
        Ok(())
    }
}

/// Handler that fails a fixed number of leading attempts, then succeeds and
/// commits.
pub(crate) struct CountingHandler {
    pub calls: AtomicU32,
    failures: u32,
    error_text: &'static str,
}

impl CountingHandler {
    pub fn succeeding() -> Self {
        Self::failing_first(0, "")
    }

    pub fn failing_first(failures: u32, error_text: &'static str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
            error_text,
        }
    }

    pub fn always_failing(error_text: &'static str) -> Self {
        Self::failing_first(u32::MAX, error_text)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(
        &self,
        _shutdown: &CancellationToken,
        message: &DeliveredMessage,
    ) -> anyhow::Result<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            anyhow::bail!("{}", self.error_text);
        }
        message.commit()?;
        Ok(())
    }
}

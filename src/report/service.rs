//! Reporter delivery loop.
//!
//! Verdicts come off the queue and are delivered by independent tasks so a
//! slow sink never stalls event ingestion. Failed deliveries retry with
//! bounded exponential backoff; after the last attempt the verdict is
//! dropped and a single meta-alert is attempted.

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::queue::VerdictQueue;
use super::sink::VerdictSink;
use crate::monitor::model::Verdict;

const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(10);

pub struct ReporterService {
    queue: Arc<VerdictQueue>,
    sink: Arc<dyn VerdictSink>,
    retry_max: u32,
    flush_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ReporterService {
    pub fn new(
        queue: Arc<VerdictQueue>,
        sink: Arc<dyn VerdictSink>,
        retry_max: u32,
        flush_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            sink,
            retry_max,
            flush_timeout,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("Reporter started");
        let mut deliveries: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                maybe_verdict = self.queue.pop() => match maybe_verdict {
                    Some(verdict) => {
                        let sink = Arc::clone(&self.sink);
                        let retry_max = self.retry_max;
                        deliveries.spawn(deliver(sink, verdict, retry_max));
                    }
                    None => break,
                },
                _ = self.shutdown.changed() => break,
                Some(_) = deliveries.join_next(), if !deliveries.is_empty() => {}
            }
        }

        // Drain whatever is still queued, then flush in-flight deliveries
        // under the final deadline.
        while let Some(verdict) = self.queue.try_pop().await {
            deliveries.spawn(deliver(Arc::clone(&self.sink), verdict, self.retry_max));
        }
        let flush = async {
            while deliveries.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.flush_timeout, flush).await.is_err() {
            warn!("Reporter flush deadline reached with deliveries still pending");
        }
        info!("Reporter stopped");
    }
}

async fn deliver(sink: Arc<dyn VerdictSink>, verdict: Verdict, retry_max: u32) {
    let mut delay = RETRY_BASE;
    for attempt in 1..=retry_max {
        match sink.emit(&verdict).await {
            Ok(()) => return,
            Err(e) if attempt < retry_max => {
                warn!(
                    "Sink failed for {} (attempt {attempt}/{retry_max}): {e}",
                    verdict.container_id
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
            }
            Err(e) => error!(
                "Sink failed for {} after {retry_max} attempts, dropping verdict: {e}",
                verdict.container_id
            ),
        }
    }

    let meta = Verdict::sink_unavailable(&verdict);
    if let Err(e) = sink.emit(&meta).await {
        error!("Meta-alert delivery failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::model::{ReasonCode, Severity};
    use crate::report::sink::SinkError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        /// Deliveries fail while the counter is below this.
        fail_first: u32,
        calls: AtomicU32,
        reasons: Mutex<Vec<ReasonCode>>,
    }

    impl FlakySink {
        fn failing(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
                reasons: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VerdictSink for FlakySink {
        async fn emit(&self, verdict: &Verdict) -> Result<(), SinkError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.reasons.lock().unwrap().push(verdict.reason);
            if call < self.fail_first {
                return Err(SinkError::Io(std::io::Error::other("sink down")));
            }
            Ok(())
        }

        async fn emit_sample(
            &self,
            _sample: &crate::monitor::model::ResourceSample,
        ) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn verdict() -> Verdict {
        Verdict::new(
            "c1",
            Severity::Critical,
            ReasonCode::UnexpectedExit,
            "unexpected exit: code 137",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_and_meta_alert_once() {
        let sink = Arc::new(FlakySink::failing(u32::MAX));
        deliver(Arc::clone(&sink) as Arc<dyn VerdictSink>, verdict(), 5).await;

        // 5 delivery attempts plus exactly one meta-alert attempt.
        assert_eq!(sink.calls.load(Ordering::SeqCst), 6);
        let reasons = sink.reasons.lock().unwrap();
        assert_eq!(reasons[..5], [ReasonCode::UnexpectedExit; 5]);
        assert_eq!(reasons[5], ReasonCode::SinkUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover_without_meta_alert() {
        let sink = Arc::new(FlakySink::failing(2));
        deliver(Arc::clone(&sink) as Arc<dyn VerdictSink>, verdict(), 5).await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        let reasons = sink.reasons.lock().unwrap();
        assert!(reasons.iter().all(|r| *r == ReasonCode::UnexpectedExit));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_flushes_queued_verdicts_on_close() {
        let queue = Arc::new(VerdictQueue::new(8));
        let sink = Arc::new(FlakySink::failing(0));
        queue.push(verdict()).await;
        queue.push(verdict()).await;
        queue.close();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = ReporterService::new(
            Arc::clone(&queue),
            Arc::clone(&sink) as Arc<dyn VerdictSink>,
            5,
            Duration::from_secs(10),
            shutdown_rx,
        );
        service.run().await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::grader::TestCase;
use crate::queue::{GradingQueue, GradingReply, GradingRequest};
use crate::sandbox::SandboxProvider;
use crate::testing::{Question, run_tests};

/// Pulls requests off the queue one at a time until cancelled
///
/// Every request is graded on a fresh sandbox obtained for slot `id`, on the
/// blocking thread pool, so a slow submission never stalls the runtime.
pub async fn worker(
    id: usize,
    provider: Arc<dyn SandboxProvider>,
    queue: Arc<GradingQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            request = queue.pop() => {
                let request_id = request.id();
                log::info!("Worker {id} got request {request_id} ({}) from queue", request.language());
                let (question, tests, responder) = request.into_parts();

                let provider = Arc::clone(&provider);
                let handle = tokio::task::spawn_blocking(move || -> GradingReply {
                    let mut sandbox = provider.sandbox_for(&question.language, id)?;
                    let outcome = run_tests(sandbox.as_mut(), &question, &tests);
                    log::info!("Request {request_id} finished on worker {id}");
                    outcome
                });

                match handle.await {
                    Ok(reply) => {
                        if responder.send(reply).is_err() {
                            log::warn!("Nobody waiting for the result of request {request_id}");
                        } else {
                            log::debug!("Request {request_id} result sent back from worker {id}");
                        }
                    }
                    Err(e) => {
                        log::error!("Grading request {request_id} failed on worker {id}: {e}");
                    }
                }
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

/// A pool of grading workers fed from one queue
///
/// Must be started from inside a tokio runtime.
pub struct GradingService {
    queue: Arc<GradingQueue>,
    token: CancellationToken,
    workers: JoinSet<anyhow::Result<()>>,
    next_id: AtomicU64,
}

impl GradingService {
    pub fn start(provider: Arc<dyn SandboxProvider>, n_workers: usize) -> Self {
        let queue = Arc::new(GradingQueue::new());
        let token = CancellationToken::new();

        let mut workers = JoinSet::new();
        for i in 0..n_workers {
            workers.spawn(worker(i, provider.clone(), queue.clone(), token.clone()));
        }
        log::info!("Grading service started with {n_workers} worker(s)");

        Self {
            queue,
            token,
            workers,
            next_id: AtomicU64::new(1),
        }
    }

    /// Queues a submission; the reply arrives on the returned receiver
    pub async fn submit(
        &self,
        question: Question,
        tests: Vec<TestCase>,
    ) -> (u64, oneshot::Receiver<GradingReply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (request, receiver) = GradingRequest::new(id, question, tests);
        self.queue.push(request).await;
        (id, receiver)
    }

    /// Queues a submission and waits for its grading
    pub async fn grade(&self, question: Question, tests: Vec<TestCase>) -> anyhow::Result<GradingReply> {
        let (id, receiver) = self.submit(question, tests).await;
        receiver
            .await
            .map_err(|_| anyhow::anyhow!("Grading request {id} was dropped before completing"))
    }

    /// Withdraws a submission that has not started yet
    pub async fn cancel(&self, id: u64) -> bool {
        self.queue.cancel(id).await
    }

    pub async fn pending(&self) -> usize {
        self.queue.len().await
    }

    /// Stops the workers once their current request is done
    pub async fn shutdown(mut self) {
        self.token.cancel();
        while let Some(res) = self.workers.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("Worker exited with error: {e}"),
                Err(e) => log::error!("Worker task panicked: {e}"),
            }
        }
        log::info!("Grading service stopped");
    }
}

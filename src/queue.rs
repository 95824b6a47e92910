use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify, oneshot};

use crate::grader::TestCase;
use crate::testing::{GradingError, Question, TestingOutcome};

pub type GradingReply = Result<TestingOutcome, GradingError>;

/// One submission waiting to be graded
pub struct GradingRequest {
    id: u64,
    question: Question,
    tests: Vec<TestCase>,
    responder: oneshot::Sender<GradingReply>,
}

impl GradingRequest {
    /// A request plus the receiver its grading reply will arrive on
    pub fn new(
        id: u64,
        question: Question,
        tests: Vec<TestCase>,
    ) -> (Self, oneshot::Receiver<GradingReply>) {
        let (responder, receiver) = oneshot::channel();
        let request = Self {
            id,
            question,
            tests,
            responder,
        };
        (request, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.question.language
    }

    pub fn into_parts(self) -> (Question, Vec<TestCase>, oneshot::Sender<GradingReply>) {
        (self.question, self.tests, self.responder)
    }
}

/// In-memory FIFO of pending grading requests
#[derive(Default)]
pub struct GradingQueue {
    queue: Mutex<VecDeque<GradingRequest>>,
    notify: Notify,
}

impl GradingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, request: GradingRequest) {
        self.queue.lock().await.push_back(request);
        self.notify.notify_one();
    }

    /// Waits for the oldest pending request
    pub async fn pop(&self) -> GradingRequest {
        loop {
            if let Some(request) = self.queue.lock().await.pop_front() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Drops a request that no worker has picked up yet
    pub async fn cancel(&self, id: u64) -> bool {
        let mut queue = self.queue.lock().await;
        let before_len = queue.len();
        queue.retain(|r| r.id() != id);
        before_len != queue.len()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

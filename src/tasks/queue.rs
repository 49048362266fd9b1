//! In-memory task queue.
//!
//! Priority-ordered (lower number first, FIFO within a priority level)
//! with a blocking pop so workers stay responsive to shutdown. Priority
//! is advisory: exact dequeue order across workers is not deterministic.

use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::models::TaskType;

/// How a task executes once a worker picks it up.
#[derive(Debug, Clone)]
pub enum TaskMode {
    /// Run the analysis from scratch
    Fresh,
    /// Replay a pre-computed payload behind a realistic progress schedule
    CachedReplay { payload: Value },
    /// Wait for a sibling task to populate the daily cache, then reuse it
    WaitingOn { source_task_id: String },
}

/// Queue message describing one unit of work.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub task_id: String,
    pub user_id: String,
    pub task_type: TaskType,
    pub input_params: Value,
    pub priority: i64,
    pub mode: TaskMode,
}

struct QueuedTask {
    priority: i64,
    seq: u64,
    descriptor: TaskDescriptor,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap; invert so lower priority numbers (and
    // earlier arrivals) pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct TaskQueue {
    heap: Mutex<(BinaryHeap<QueuedTask>, u64)>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new((BinaryHeap::new(), 0)),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, descriptor: TaskDescriptor) {
        {
            let mut guard = self.heap.lock();
            let seq = guard.1;
            guard.1 += 1;
            let priority = descriptor.priority;
            guard.0.push(QueuedTask {
                priority,
                seq,
                descriptor,
            });
        }
        self.notify.notify_one();
    }

    /// Pop the next descriptor, waiting up to `timeout`.
    pub async fn pop(&self, timeout: Duration) -> Option<TaskDescriptor> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.heap.lock().0.pop() {
                return Some(task.descriptor);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

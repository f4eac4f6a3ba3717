// pipeline.rs — Bounded blocking queues and stage workers.
//
// The reconstruction is a chain of stages connected by bounded queues:
//
//   Source → [Weighting] → [Filtering] → [Back-projection ×D] → Merge
//
// Each stage owns one or more OS threads. Queues are crossbeam bounded
// channels: producers block on full, consumers block on empty, so a
// slow back-projection throttles the source instead of ballooning
// memory. There are no timeouts — bounded capacity *is* the flow
// control.
//
// END OF STREAM
// ──────────────
// Completion travels through the queues as a typed `Message::End`
// variant, never as a magic "invalid" payload a consumer could
// accidentally treat as data. `finish(n)` broadcasts one End per
// consumer; each worker stops at the first End it receives, so every
// worker of every stage sees the sentinel exactly once.
//
// FAILURE
// ────────
// A failing worker returns its error and drops its channel endpoints.
// Dropping a sender disconnects the queue: downstream workers observe
// end-of-stream and wind down; upstream workers see a send failure and
// wind down too. The original error surfaces when the driver joins the
// workers — `StageWorker::join` also converts a worker panic into a
// `PipelineError` instead of poisoning the caller with `unwrap`.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

// ---------------------------------------------------------------------------
// Messages and queues
// ---------------------------------------------------------------------------

/// A queue element: payload or end-of-stream.
pub enum Message<T> {
    Data(T),
    End,
}

/// Sending half of a stage queue.
pub struct QueueSender<T> {
    tx: Sender<Message<T>>,
}

/// Receiving half of a stage queue. Cloneable so several workers of one
/// stage can drain the same queue.
pub struct QueueReceiver<T> {
    rx: Receiver<Message<T>>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        QueueReceiver {
            rx: self.rx.clone(),
        }
    }
}

/// The peer side of a queue has gone away (its worker failed and
/// dropped the endpoint). The failure itself is reported by that
/// worker's join; the observer just winds down.
#[derive(Debug, PartialEq, Eq)]
pub struct Disconnected;

/// Create a bounded stage queue. `capacity` must be at least 2× the
/// number of concurrent workers on either side to rule out deadlock;
/// [`queue_capacity`] computes a safe default.
pub fn queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    assert!(capacity >= 2, "queue capacity {capacity} < 2");
    let (tx, rx) = bounded(capacity);
    (QueueSender { tx }, QueueReceiver { rx })
}

/// Default capacity for a stage boundary with `workers` consumers.
#[inline]
pub fn queue_capacity(workers: usize) -> usize {
    (2 * workers).max(4)
}

impl<T> QueueSender<T> {
    /// Send one payload, blocking while the queue is full.
    pub fn send(&self, item: T) -> Result<(), Disconnected> {
        self.tx.send(Message::Data(item)).map_err(|_| Disconnected)
    }

    /// Broadcast end-of-stream to `consumers` workers, one sentinel
    /// each. Call exactly once, after the last payload.
    pub fn finish(&self, consumers: usize) -> Result<(), Disconnected> {
        for _ in 0..consumers {
            self.tx.send(Message::End).map_err(|_| Disconnected)?;
        }
        Ok(())
    }
}

impl<T> QueueReceiver<T> {
    /// Receive the next payload, blocking while the queue is empty.
    /// `None` means end-of-stream — either the sentinel or a
    /// disconnected producer; in both cases the worker is done.
    pub fn recv(&self) -> Option<T> {
        match self.rx.recv() {
            Ok(Message::Data(item)) => Some(item),
            Ok(Message::End) | Err(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A fatal pipeline failure. Any one of these aborts the whole
/// reconstruction; there are no per-projection retries.
#[derive(Debug)]
pub enum PipelineError {
    /// A stage hit an unrecoverable error (I/O, GPU runtime, ...).
    Stage {
        stage: &'static str,
        message: String,
    },
    /// A queue peer vanished mid-stream; the root cause is the error
    /// reported by the stage that dropped it.
    Disconnected { stage: &'static str },
    /// A worker thread panicked.
    Panicked { stage: &'static str },
}

impl PipelineError {
    pub fn stage(stage: &'static str, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage,
            message: message.into(),
        }
    }

    pub fn disconnected(stage: &'static str) -> Self {
        PipelineError::Disconnected { stage }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Stage { stage, message } => {
                write!(f, "stage {stage} failed: {message}")
            }
            PipelineError::Disconnected { stage } => {
                write!(f, "stage {stage}: queue peer disconnected")
            }
            PipelineError::Panicked { stage } => write!(f, "stage {stage} panicked"),
        }
    }
}

impl std::error::Error for PipelineError {}

// ---------------------------------------------------------------------------
// Stage workers
// ---------------------------------------------------------------------------

/// One worker thread of a stage. `join` returns the worker's result
/// and never panics — a panicking worker becomes
/// `PipelineError::Panicked`.
pub struct StageWorker<T = ()> {
    stage: &'static str,
    handle: JoinHandle<Result<T, PipelineError>>,
}

impl<T: Send + 'static> StageWorker<T> {
    /// Spawn a named worker thread.
    pub fn spawn<F>(stage: &'static str, f: F) -> Self
    where
        F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(stage.to_string())
            .spawn(f)
            .expect("failed to spawn stage worker thread");
        StageWorker { stage, handle }
    }

    /// Wait for the worker and surface its result.
    pub fn join(self) -> Result<T, PipelineError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Panicked { stage: self.stage }),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.stage
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

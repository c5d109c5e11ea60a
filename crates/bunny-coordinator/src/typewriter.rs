//! Paced delivery of generated text into the transcript.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::lock;
use crate::transcript::{Transcript, TurnId};

#[derive(Debug)]
struct Segment {
    target: TurnId,
    token: CancellationToken,
    text: String,
}

/// Pending text, sliced into fixed-size pieces.
#[derive(Debug)]
pub struct TypewriterQueue {
    segments: VecDeque<Segment>,
    slice: usize,
}

impl TypewriterQueue {
    /// Slices of `slice` characters. Zero is treated as one.
    pub fn new(slice: usize) -> Self {
        Self {
            segments: VecDeque::new(),
            slice: slice.max(1),
        }
    }

    /// Queue `text` for `target`. Refused once `token` is cancelled.
    pub fn push(&mut self, target: TurnId, token: &CancellationToken, text: &str) -> bool {
        if token.is_cancelled() {
            return false;
        }
        if !text.is_empty() {
            self.segments.push_back(Segment {
                target,
                token: token.clone(),
                text: text.to_string(),
            });
        }
        true
    }

    /// Take the next slice. Segments whose token was cancelled are discarded.
    pub fn next_slice(&mut self) -> Option<(TurnId, String)> {
        loop {
            let segment = self.segments.front_mut()?;
            if segment.token.is_cancelled() || segment.text.is_empty() {
                self.segments.pop_front();
                continue;
            }

            let end = segment
                .text
                .char_indices()
                .nth(self.slice)
                .map(|(i, _)| i)
                .unwrap_or(segment.text.len());
            let piece: String = segment.text.drain(..end).collect();
            let target = segment.target;
            if segment.text.is_empty() {
                self.segments.pop_front();
            }
            return Some((target, piece));
        }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.segments
            .iter()
            .all(|s| s.token.is_cancelled() || s.text.is_empty())
    }
}

#[derive(Debug)]
struct State {
    queue: TypewriterQueue,
    running: bool,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    transcript: Arc<Mutex<Transcript>>,
    tick: Duration,
    idle: Notify,
}

/// Appends queued text to the transcript on a steady timer.
///
/// The timer task starts on the first enqueue and exits once the queue is
/// drained. Lock order is typewriter state, then transcript.
#[derive(Debug, Clone)]
pub struct Typewriter {
    inner: Arc<Inner>,
}

impl Typewriter {
    pub fn new(transcript: Arc<Mutex<Transcript>>, slice: usize, tick: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: TypewriterQueue::new(slice),
                    running: false,
                }),
                transcript,
                tick,
                idle: Notify::new(),
            }),
        }
    }

    /// Queue text for `target`. Returns `false` if `token` is already cancelled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, target: TurnId, token: &CancellationToken, text: &str) -> bool {
        let mut state = lock(&self.inner.state);
        if !state.queue.push(target, token, text) {
            return false;
        }
        if !state.running && !state.queue.is_empty() {
            state.running = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(run(inner));
        }
        true
    }

    /// Drop all pending text.
    pub fn clear(&self) {
        lock(&self.inner.state).queue.clear();
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.inner.state);
        !state.running && state.queue.is_empty()
    }

    /// Resolve once all queued text has been delivered or dropped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let mut state = lock(&inner.state);
        match state.queue.next_slice() {
            Some((target, piece)) => {
                // Still holding the state lock, so clear() waits for this append.
                if !lock(&inner.transcript).append_to(target, &piece) {
                    trace!(turn = %target, "turn is gone, dropping slice");
                }
            }
            None => {
                state.running = false;
                drop(state);
                inner.idle.notify_waiters();
                return;
            }
        }
    }
}

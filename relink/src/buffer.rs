//! Retransmission buffer for the outgoing half of a connection.
//!
//! Chunks are appended by `write`, handed out in order by the drain side, and
//! retained until the peer acknowledges them. A Sync from the peer moves the
//! drain cursor back (`seek`) so retained chunks go out again.
//!
//! ```text
//!   base            cursor               end
//!    |   sent, unacked |   not yet drained  |
//!    +-----------------+--------------------+
//! ```

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{RelinkError, Result};
use crate::frame::SeqNo;

/// The part of the buffer the receive state machine drives when the peer
/// reports progress.
pub trait Outbox {
    /// Number of chunks ever written; no valid Ack/Sync can exceed it.
    fn total_enqueued(&self) -> SeqNo;
    /// Move the drain cursor to `seqno`.
    fn seek(&self, seqno: SeqNo);
    /// Forget every chunk below `upto`.
    fn remove(&self, upto: SeqNo);
}

/// Result of one `Buffer::next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drain {
    Chunk { seqno: SeqNo, payload: Bytes },
    /// Closed and everything has been drained. Reported once; a later seek
    /// re-arms it.
    Exhausted,
    Aborted,
}

/// An item from a `DrainChannel`. The channel ending means the buffer was
/// aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainItem {
    Chunk { seqno: SeqNo, payload: Bytes },
    Exhausted,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<Bytes>,
    base: SeqNo,
    cursor: SeqNo,
    closed: bool,
    aborted: bool,
    exhausted_reported: bool,
}

impl State {
    fn end(&self) -> SeqNo {
        self.base + self.queue.len() as SeqNo
    }
}

/// Ordered store of outgoing chunks not yet acknowledged by the peer.
pub struct Buffer {
    state: Mutex<State>,
    changed: Notify,
    memory_cap: usize,
}

impl Buffer {
    /// Create a buffer that holds at most `memory_cap` unacknowledged chunks
    /// before `write` starts to wait.
    pub fn new(memory_cap: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            changed: Notify::new(),
            memory_cap: memory_cap.get(),
        }
    }

    /// Append a chunk, waiting while the buffer is full.
    pub async fn write(&self, payload: Bytes) -> Result<()> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.aborted {
                    return Err(RelinkError::ConnectionAborted);
                }
                if st.closed {
                    return Err(RelinkError::BufferClosed);
                }
                if st.queue.len() < self.memory_cap {
                    st.queue.push_back(payload);
                    drop(st);
                    self.changed.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Wait for the next drain outcome, advancing the cursor on a chunk.
    ///
    /// Cancel safe: state only changes right before this resolves.
    pub async fn next(&self) -> Drain {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.aborted {
                    return Drain::Aborted;
                }
                if st.cursor < st.end() {
                    let seqno = st.cursor;
                    let payload = st.queue[(seqno - st.base) as usize].clone();
                    st.cursor += 1;
                    return Drain::Chunk { seqno, payload };
                }
                if st.closed && !st.exhausted_reported {
                    st.exhausted_reported = true;
                    return Drain::Exhausted;
                }
            }
            notified.await;
        }
    }

    /// Ordered view of the drain side for the send loop.
    pub fn drain_channel(self: &Arc<Self>) -> DrainChannel {
        DrainChannel {
            buffer: Arc::clone(self),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed for writes and every chunk has been handed to the drain side.
    pub fn is_drained(&self) -> bool {
        let st = self.state.lock();
        st.closed && st.cursor == st.end()
    }

    /// Stop accepting writes. Already written chunks still drain.
    ///
    /// Returns `true` if this call closed the buffer.
    pub fn close(&self) -> bool {
        let first = {
            let mut st = self.state.lock();
            !std::mem::replace(&mut st.closed, true)
        };
        self.changed.notify_waiters();
        first
    }

    /// Discard everything and fail all pending and future operations.
    pub fn abort(&self) {
        {
            let mut st = self.state.lock();
            st.aborted = true;
            st.queue.clear();
        }
        self.changed.notify_waiters();
    }

    /// Number of chunks written but not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Lazy drain stream over a `Buffer`.
///
/// Nothing is taken from the buffer ahead of the consumer: the cursor moves
/// only when `recv` resolves, so a seek applies to the very next item.
pub struct DrainChannel {
    buffer: Arc<Buffer>,
}

impl DrainChannel {
    /// Next item, or `None` once the buffer is aborted. Cancel safe.
    pub async fn recv(&mut self) -> Option<DrainItem> {
        match self.buffer.next().await {
            Drain::Chunk { seqno, payload } => Some(DrainItem::Chunk { seqno, payload }),
            Drain::Exhausted => Some(DrainItem::Exhausted),
            Drain::Aborted => None,
        }
    }
}

impl Outbox for Buffer {
    fn total_enqueued(&self) -> SeqNo {
        self.state.lock().end()
    }

    fn seek(&self, seqno: SeqNo) {
        {
            let mut st = self.state.lock();
            st.cursor = seqno.clamp(st.base, st.end());
            st.exhausted_reported = false;
        }
        self.changed.notify_waiters();
    }

    fn remove(&self, upto: SeqNo) {
        {
            let mut st = self.state.lock();
            let upto = upto.min(st.end());
            while st.base < upto {
                st.queue.pop_front();
                st.base += 1;
            }
            if st.cursor < st.base {
                st.cursor = st.base;
            }
        }
        self.changed.notify_waiters();
    }
}

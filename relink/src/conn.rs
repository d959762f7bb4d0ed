//! The logical connection.
//!
//! Lifecycle:
//!
//! ```text
//! Open --(fatal receive error)--> ClosingAbrupt --> Closed
//! Open --(close)--> Lingering --(drained / linger expired)--> Closed
//! Lingering --(fatal receive error)--> ClosingAbrupt --> Closed
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::Instrument;

use crate::buffer::Buffer;
use crate::error::{RelinkError, Result};
use crate::frame::{Codec, WireCodec};
use crate::recv::{ReceiveLoop, RecvState};
use crate::send::SendLoop;
use crate::signal::AbortSignal;
use crate::substrate::Substrate;

/// Capacity of the receive-to-send control channel. One slot is enough to
/// let the receive loop hand over a stitched writer while the send loop is
/// busy writing.
const CONTROL_QUEUE: usize = 1;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle states of a logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and writing normally.
    Open,
    /// `close` was called; queued data may still flush before the linger
    /// timer fires.
    Lingering,
    /// A fatal error ended the connection; teardown in progress.
    ClosingAbrupt,
    /// Both directions have terminated.
    Closed,
}

impl ConnectionState {
    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Open, Lingering) | (Open | Lingering, ClosingAbrupt) | (Open | Lingering | ClosingAbrupt, Closed)
        )
    }

    /// Move `tx` to `next` if the transition is legal. Returns whether it
    /// moved.
    pub(crate) fn advance(tx: &watch::Sender<ConnectionState>, next: ConnectionState) -> bool {
        tx.send_if_modified(|state| {
            if state.can_become(next) {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Lingering => write!(f, "Lingering"),
            ConnectionState::ClosingAbrupt => write!(f, "ClosingAbrupt"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Send an Ack after this many accepted chunks.
    pub ack_frequency: u64,
    /// Grace period between `close` and the hard abort.
    pub linger: Duration,
    /// Unacknowledged chunks held before `write` waits.
    pub memory_cap: usize,
    /// Chunks the receive loop may queue ahead of the reader.
    pub read_queue: usize,
    /// Largest payload `write` accepts.
    pub max_payload: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            ack_frequency: 20,
            linger: Duration::from_secs(60),
            memory_cap: 40,
            read_queue: 3,
            max_payload: 100_000,
        }
    }
}

impl ConnConfig {
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("ack_frequency", self.ack_frequency == 0),
            ("memory_cap", self.memory_cap == 0),
            ("read_queue", self.read_queue == 0),
            ("max_payload", self.max_payload == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(RelinkError::InvalidConfig(format!("{name} must be non-zero"))),
            None => Ok(()),
        }
    }
}

/// A reliable, ordered logical connection over a substrate that may swap
/// its physical leg underneath.
///
/// Must be created inside a tokio runtime: construction spawns the receive
/// and send loops.
pub struct Conn<S: Substrate> {
    sub: Arc<S>,
    buffer: Arc<Buffer>,
    reads: Mutex<mpsc::Receiver<Result<Bytes>>>,
    /// Linearizes `write` and `close`.
    write_lock: Mutex<()>,
    abort: AbortSignal,
    lifecycle: Arc<watch::Sender<ConnectionState>>,
    linger: Duration,
    max_payload: usize,
    span: tracing::Span,
}

impl<S: Substrate> Conn<S> {
    /// Start a connection over an established substrate with the default
    /// codec.
    pub fn new(sub: S, config: ConnConfig) -> Result<Self> {
        Self::with_codec(sub, config, WireCodec)
    }

    pub fn with_codec(sub: S, config: ConnConfig, codec: impl Codec) -> Result<Self> {
        config.validate()?;
        let ack_frequency = NonZeroU64::new(config.ack_frequency)
            .ok_or_else(|| RelinkError::InvalidConfig("ack_frequency must be non-zero".into()))?;
        let memory_cap = NonZeroUsize::new(config.memory_cap)
            .ok_or_else(|| RelinkError::InvalidConfig("memory_cap must be non-zero".into()))?;

        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        let span = tracing::debug_span!("relink_conn", conn_id);

        let sub = Arc::new(sub);
        let codec: Arc<dyn Codec> = Arc::new(codec);
        let buffer = Arc::new(Buffer::new(memory_cap));
        let abort = AbortSignal::default();
        let (lifecycle, _) = watch::channel(ConnectionState::Open);
        let lifecycle = Arc::new(lifecycle);

        // +1 for the slot the receive loop reserves for its terminal error.
        let (deliver, reads) = mpsc::channel(config.read_queue + 1);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE);
        let drain = buffer.drain_channel();

        let receive = tokio::spawn(
            ReceiveLoop {
                sub: Arc::clone(&sub),
                codec: Arc::clone(&codec),
                buffer: Arc::clone(&buffer),
                state: RecvState::new(ack_frequency),
                ctrl: ctrl_tx,
                deliver,
                abort: abort.clone(),
                lifecycle: Arc::clone(&lifecycle),
            }
            .run()
            .instrument(span.clone()),
        );
        let send = tokio::spawn(
            SendLoop {
                sub: Arc::clone(&sub),
                codec,
                buffer: Arc::clone(&buffer),
                ctrl: ctrl_rx,
                drain,
                abort: abort.clone(),
            }
            .run()
            .instrument(span.clone()),
        );
        {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(
                async move {
                    if let Err(err) = receive.await {
                        tracing::error!(error = %err, "receive loop failed");
                    }
                    if let Err(err) = send.await {
                        tracing::error!(error = %err, "send loop failed");
                    }
                    ConnectionState::advance(&lifecycle, ConnectionState::Closed);
                    tracing::debug!("connection closed");
                }
                .instrument(span.clone()),
            );
        }

        tracing::debug!(parent: &span, ?config, "connection open");
        Ok(Self {
            sub,
            buffer,
            reads: Mutex::new(reads),
            write_lock: Mutex::new(()),
            abort,
            lifecycle,
            linger: config.linger,
            max_payload: config.max_payload,
            span,
        })
    }

    /// Wait for the next chunk from the peer.
    ///
    /// Returns the terminal error once the connection has ended; an abrupt
    /// end without a specific cause is `ConnectionAborted`.
    pub async fn read(&self) -> Result<Bytes> {
        let mut reads = self.reads.lock().await;
        match reads.recv().await {
            Some(item) => item,
            None => Err(RelinkError::ConnectionAborted),
        }
    }

    /// Queue a chunk for delivery.
    ///
    /// Waits only for buffer space. Transport trouble is never reported
    /// here; it surfaces through `read`. Fails once the connection is closed
    /// or broken.
    pub async fn write(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > self.max_payload {
            return Err(RelinkError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        let _guard = self.write_lock.lock().await;
        self.buffer.write(payload).await
    }

    /// Stop accepting writes and abort the connection after the linger
    /// period. Returns immediately; queued chunks keep flowing meanwhile.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !self.buffer.close() {
            return Ok(());
        }
        ConnectionState::advance(&self.lifecycle, ConnectionState::Lingering);

        let abort = self.abort.clone();
        let linger = self.linger;
        tokio::spawn(
            async move {
                tracing::debug!(?linger, "linger started");
                tokio::time::sleep(linger).await;
                tracing::debug!("linger expired");
                abort.fire();
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.lifecycle.borrow()
    }

    /// Watch lifecycle transitions as they happen.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }

    /// Resolves once both directions have terminated.
    pub async fn closed(&self) {
        let mut rx = self.lifecycle.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.sub.remote_addr()
    }
}

impl<S: Substrate> Drop for Conn<S> {
    fn drop(&mut self) {
        // After `close` the loops finish on their own, by draining or when
        // the linger task fires abort.
        if self.buffer.is_closed() {
            return;
        }
        self.abort.fire();
        self.buffer.abort();
    }
}

//! Receive side: the state machine that orders incoming chunks and drives
//! the Ack/Sync protocol, and the task that runs it against a substrate.

use std::num::NonZeroU64;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::buffer::{Buffer, Outbox};
use crate::conn::ConnectionState;
use crate::error::{RelinkError, Result};
use crate::frame::{Codec, Message, SeqNo};
use crate::send::Control;
use crate::signal::AbortSignal;
use crate::substrate::{ReadError, Substrate};

/// What became of one incoming chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Already delivered; dropped.
    Duplicate,
    /// Next in line. `ack` is set when an Ack is due.
    Accepted { payload: Bytes, ack: Option<SeqNo> },
    /// Ahead of `nread`; dropped, and the peer should resend from `sync`.
    Gap { sync: SeqNo },
}

/// Per-connection receive state. Owned by the receive loop alone.
#[derive(Debug)]
pub struct RecvState {
    /// Next expected incoming seqno.
    nread: SeqNo,
    /// Lowest outgoing seqno the peer has not yet confirmed.
    nackd: SeqNo,
    ack_frequency: u64,
}

impl RecvState {
    pub fn new(ack_frequency: NonZeroU64) -> Self {
        Self {
            nread: 0,
            nackd: 0,
            ack_frequency: ack_frequency.get(),
        }
    }

    pub fn nread(&self) -> SeqNo {
        self.nread
    }

    pub fn nackd(&self) -> SeqNo {
        self.nackd
    }

    pub fn on_chunk(&mut self, seqno: SeqNo, payload: Bytes) -> ChunkOutcome {
        if seqno < self.nread {
            return ChunkOutcome::Duplicate;
        }
        if seqno > self.nread {
            return ChunkOutcome::Gap { sync: self.nread };
        }
        self.nread += 1;
        let ack = (self.nread % self.ack_frequency == 0).then_some(self.nread);
        ChunkOutcome::Accepted { payload, ack }
    }

    /// The peer asks us to rewind to `nackd`.
    pub fn on_sync(&mut self, nackd: SeqNo, outbox: &impl Outbox) -> Result<()> {
        self.admit(nackd, outbox)?;
        // Seek before remove: pruning first would let the drain side race
        // ahead with fresh chunks before the rewound ones go out again.
        outbox.seek(nackd);
        outbox.remove(nackd);
        Ok(())
    }

    /// The peer confirms everything below `nackd`.
    pub fn on_ack(&mut self, nackd: SeqNo, outbox: &impl Outbox) -> Result<()> {
        self.admit(nackd, outbox)?;
        outbox.remove(nackd);
        Ok(())
    }

    fn admit(&mut self, nackd: SeqNo, outbox: &impl Outbox) -> Result<()> {
        let upper = outbox.total_enqueued();
        if nackd < self.nackd || nackd > upper {
            return Err(RelinkError::PeerMisbehaved {
                nackd,
                lower: self.nackd,
                upper,
            });
        }
        self.nackd = nackd;
        Ok(())
    }
}

/// Task that owns the read side of the substrate.
pub(crate) struct ReceiveLoop<S: Substrate> {
    pub(crate) sub: Arc<S>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) state: RecvState,
    pub(crate) ctrl: mpsc::Sender<Control<S::Writer>>,
    pub(crate) deliver: mpsc::Sender<Result<Bytes>>,
    pub(crate) abort: AbortSignal,
    pub(crate) lifecycle: Arc<watch::Sender<ConnectionState>>,
}

impl<S: Substrate> ReceiveLoop<S> {
    pub(crate) async fn run(mut self) {
        // One slot stays reserved for the terminal error so pushing it can
        // never block on a reader that has stopped reading.
        let fault = self.deliver.clone().reserve_owned().await;

        let err = loop {
            let payload = match self.next_chunk().await {
                Ok(payload) => payload,
                Err(err) => break err,
            };
            // A closed connection whose handle is gone keeps serving Ack and
            // Sync until it drains or lingers out; its payloads go nowhere.
            if self.deliver.send(Ok(payload)).await.is_err() {
                tracing::trace!("reader gone, discarding chunk");
            }
        };

        if self.abort.is_fired() {
            tracing::debug!(error = %err, nread = self.state.nread(), "receive loop terminating");
        } else {
            tracing::warn!(error = %err, nread = self.state.nread(), "receive loop terminating");
            ConnectionState::advance(&self.lifecycle, ConnectionState::ClosingAbrupt);
        }

        if let Ok(permit) = fault {
            permit.send(Err(err));
        }
        // Dropping `self` closes the read and control channels; the send
        // loop notices through the aborted buffer and the closed control
        // channel.
        self.buffer.abort();
    }

    /// Read until the next in-order chunk, handling control traffic on the
    /// way. Any error is fatal to the connection.
    async fn next_chunk(&mut self) -> Result<Bytes> {
        loop {
            if self.abort.is_fired() {
                return Err(RelinkError::ConnectionAborted);
            }

            let raw = match self.sub.read().await {
                Ok(raw) => raw,
                Err(ReadError::Stitch(writer)) => {
                    let nread = self.state.nread();
                    tracing::debug!(nread, "substrate stitched, resyncing peer");
                    self.control(Some(writer), Message::Sync { nackd: nread })
                        .await?;
                    continue;
                }
                Err(ReadError::Fatal(err)) => {
                    if self.abort.is_fired() {
                        return Err(RelinkError::ConnectionAborted);
                    }
                    return Err(RelinkError::Transport(err));
                }
            };

            let msg = self.codec.decode(raw)?;
            tracing::trace!(%msg, "received");
            match msg {
                Message::Chunk { seqno, payload } => {
                    match self.state.on_chunk(seqno, payload) {
                        ChunkOutcome::Duplicate => {}
                        ChunkOutcome::Accepted { payload, ack } => {
                            if let Some(nackd) = ack {
                                self.control(None, Message::Ack { nackd }).await?;
                            }
                            return Ok(payload);
                        }
                        ChunkOutcome::Gap { sync } => {
                            tracing::debug!(seqno, nread = sync, "gap detected, requesting resend");
                            self.control(None, Message::Sync { nackd: sync }).await?;
                        }
                    }
                }
                Message::Sync { nackd } => self.state.on_sync(nackd, self.buffer.as_ref())?,
                Message::Ack { nackd } => self.state.on_ack(nackd, self.buffer.as_ref())?,
            }
        }
    }

    async fn control(&self, writer: Option<S::Writer>, msg: Message) -> Result<()> {
        self.ctrl
            .send(Control { writer, msg })
            .await
            .map_err(|_| RelinkError::ConnectionAborted)
    }
}

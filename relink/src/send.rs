//! Send side: the task that multiplexes control messages and drained
//! application chunks onto whichever physical writer is current.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::buffer::{Buffer, DrainChannel, DrainItem};
use crate::frame::{Codec, Message};
use crate::signal::AbortSignal;
use crate::substrate::{LegWriter, Substrate};

/// Envelope from the receive loop to the send loop. A present `writer`
/// replaces the current one before `msg` is sent.
pub(crate) struct Control<W> {
    pub(crate) writer: Option<W>,
    pub(crate) msg: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    ControlClosed,
    BufferAborted,
    Drained,
    Aborted,
}

/// Task that owns the write side of the substrate.
pub(crate) struct SendLoop<S: Substrate> {
    pub(crate) sub: Arc<S>,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) ctrl: mpsc::Receiver<Control<S::Writer>>,
    pub(crate) drain: DrainChannel,
    pub(crate) abort: AbortSignal,
}

impl<S: Substrate> SendLoop<S> {
    pub(crate) async fn run(mut self) {
        let stop = self.pump().await;
        tracing::debug!(?stop, pending = self.buffer.pending(), "send loop terminating");

        // Kill after firing abort: the read failure this causes is then
        // reported as an abort rather than a transport failure.
        self.abort.fire();
        self.sub.kill();
    }

    async fn pump(&mut self) -> Stop {
        let mut writer = loop {
            tokio::select! {
                ctrl = self.ctrl.recv() => match ctrl {
                    None => return Stop::ControlClosed,
                    Some(Control { writer: Some(writer), msg }) => {
                        self.send(&writer, &msg).await;
                        break writer;
                    }
                    Some(Control { writer: None, msg }) => {
                        tracing::trace!(%msg, "no physical writer yet, dropping");
                    }
                },
                _ = self.abort.fired() => return Stop::Aborted,
            }
        };

        loop {
            // Control first: a stitched writer must be adopted before any
            // further chunk goes out, or that chunk dies on the stale leg
            // after the peer's Sync has already rewound the buffer.
            tokio::select! {
                biased;
                ctrl = self.ctrl.recv() => match ctrl {
                    None => return Stop::ControlClosed,
                    Some(Control { writer: fresh, msg }) => {
                        if let Some(fresh) = fresh {
                            tracing::debug!("adopting stitched writer");
                            writer = fresh;
                        }
                        self.send(&writer, &msg).await;
                    }
                },
                _ = self.abort.fired() => return Stop::Aborted,
                item = self.drain.recv() => match item {
                    None => return Stop::BufferAborted,
                    // Nothing to send for now, but a Sync may still rewind
                    // the buffer.
                    Some(DrainItem::Exhausted) => {}
                    Some(DrainItem::Chunk { seqno, payload }) => {
                        // The drain only hands out a chunk when asked, so once
                        // this one is written nothing is left behind.
                        self.send(&writer, &Message::Chunk { seqno, payload }).await;
                        if self.buffer.is_drained() {
                            return Stop::Drained;
                        }
                    }
                },
            }
        }
    }

    async fn send(&self, writer: &S::Writer, msg: &Message) {
        tracing::trace!(%msg, "sending");
        if let Err(err) = writer.write(self.codec.encode(msg)).await {
            // Stale writers are expected around a stitch; the peer recovers
            // through Sync.
            tracing::debug!(error = %err, %msg, "physical write failed");
        }
    }
}

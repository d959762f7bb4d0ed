//! In-memory substrate pair with fault injection.
//!
//! `pair()` returns two connected endpoints and a `MemLink` handle that can
//! stitch the physical leg, make it lossy, or sever it. Both endpoints get
//! an initial stitch event carrying their first writer.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::substrate::{LegWriter, ReadError, Substrate};

enum Event {
    Frame(Bytes),
    Stitch(MemWriter),
    Fail(io::ErrorKind),
}

struct LinkShared {
    /// Current leg; writers for any other leg are stale.
    leg: AtomicU64,
    /// Probability of silently dropping a frame.
    loss: Mutex<f64>,
}

/// Writer bound to one leg of an in-memory link.
pub struct MemWriter {
    leg: u64,
    to: mpsc::UnboundedSender<Event>,
    shared: Arc<LinkShared>,
}

impl MemWriter {
    /// The leg this writer belongs to.
    pub fn leg(&self) -> u64 {
        self.leg
    }
}

impl LegWriter for MemWriter {
    async fn write(&self, frame: Bytes) -> io::Result<()> {
        if self.shared.leg.load(Ordering::Acquire) != self.leg {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stale leg"));
        }
        let loss = *self.shared.loss.lock();
        if loss > 0.0 && rand::random::<f64>() < loss {
            tracing::trace!(leg = self.leg, len = frame.len(), "mem link dropped frame");
            return Ok(());
        }
        self.to
            .send(Event::Frame(frame))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionReset))
    }
}

/// One end of an in-memory link.
pub struct MemSubstrate {
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Event>>,
    peer: mpsc::UnboundedSender<Event>,
    killed: AtomicBool,
    kill_notify: Notify,
}

impl MemSubstrate {
    fn new(inbox: mpsc::UnboundedReceiver<Event>, peer: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            inbox: tokio::sync::Mutex::new(inbox),
            peer,
            killed: AtomicBool::new(false),
            kill_notify: Notify::new(),
        }
    }

    /// True once `kill` has been called on this end.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

impl Substrate for MemSubstrate {
    type Writer = MemWriter;

    async fn read(&self) -> Result<Bytes, ReadError<MemWriter>> {
        let mut inbox = self.inbox.lock().await;
        loop {
            if self.is_killed() {
                return Err(ReadError::Fatal(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "substrate killed",
                )));
            }
            let event = tokio::select! {
                event = inbox.recv() => event,
                _ = self.kill_notify.notified() => continue,
            };
            return match event {
                Some(Event::Frame(frame)) => Ok(frame),
                Some(Event::Stitch(writer)) => Err(ReadError::Stitch(writer)),
                Some(Event::Fail(kind)) => {
                    Err(ReadError::Fatal(io::Error::new(kind, "physical leg failed")))
                }
                None => Err(ReadError::Fatal(io::ErrorKind::UnexpectedEof.into())),
            };
        }
    }

    fn kill(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            let _ = self.peer.send(Event::Fail(io::ErrorKind::ConnectionReset));
        }
        self.kill_notify.notify_one();
    }
}

/// Control handle over both ends of an in-memory link.
pub struct MemLink {
    shared: Arc<LinkShared>,
    to_a: mpsc::UnboundedSender<Event>,
    to_b: mpsc::UnboundedSender<Event>,
}

impl MemLink {
    /// Replace the physical leg. Both ends receive a stitch event; writers
    /// for earlier legs go stale.
    pub fn stitch(&self) -> u64 {
        let leg = self.shared.leg.fetch_add(1, Ordering::AcqRel) + 1;
        self.announce(leg);
        leg
    }

    /// Drop each frame with probability `p` from now on.
    pub fn set_loss(&self, p: f64) {
        *self.shared.loss.lock() = p.clamp(0.0, 1.0);
    }

    /// Fail both ends.
    pub fn sever(&self) {
        let _ = self.to_a.send(Event::Fail(io::ErrorKind::ConnectionReset));
        let _ = self.to_b.send(Event::Fail(io::ErrorKind::ConnectionReset));
    }

    fn writer(&self, leg: u64, to: &mpsc::UnboundedSender<Event>) -> MemWriter {
        MemWriter {
            leg,
            to: to.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    fn announce(&self, leg: u64) {
        let _ = self.to_a.send(Event::Stitch(self.writer(leg, &self.to_b)));
        let _ = self.to_b.send(Event::Stitch(self.writer(leg, &self.to_a)));
    }
}

/// Build two connected in-memory substrate endpoints.
pub fn pair() -> (MemSubstrate, MemSubstrate, MemLink) {
    let (to_a, a_inbox) = mpsc::unbounded_channel();
    let (to_b, b_inbox) = mpsc::unbounded_channel();
    let a = MemSubstrate::new(a_inbox, to_b.clone());
    let b = MemSubstrate::new(b_inbox, to_a.clone());
    let link = MemLink {
        shared: Arc::new(LinkShared {
            leg: AtomicU64::new(0),
            loss: Mutex::new(0.0),
        }),
        to_a,
        to_b,
    };
    link.announce(0);
    (a, b, link)
}

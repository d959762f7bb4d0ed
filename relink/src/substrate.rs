//! The physical transport a logical connection rides on.
//!
//! A substrate may replace its physical leg at any time ("stitching"). It
//! reports that through `ReadError::Stitch`, carrying the writer for the new
//! leg. The very first writer is delivered the same way, so a fresh
//! substrate's first read is expected to be a stitch.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;

/// Sends frames down one specific physical leg.
///
/// A writer outlives its leg: once the substrate has stitched, writes through
/// an old writer may fail or vanish.
pub trait LegWriter: Send + Sync + 'static {
    fn write(&self, frame: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}

/// Why `Substrate::read` returned without a frame.
pub enum ReadError<W> {
    /// The physical leg was replaced; `W` writes to the new one.
    Stitch(W),
    /// The substrate is gone for good.
    Fatal(io::Error),
}

impl<W> fmt::Debug for ReadError<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Stitch(_) => f.write_str("Stitch(..)"),
            ReadError::Fatal(err) => f.debug_tuple("Fatal").field(err).finish(),
        }
    }
}

/// A physical transport carrying whole frames.
pub trait Substrate: Send + Sync + 'static {
    type Writer: LegWriter;

    /// Block until the next frame arrives, the leg is stitched, or the
    /// substrate fails.
    fn read(&self) -> impl Future<Output = Result<Bytes, ReadError<Self::Writer>>> + Send;

    /// Tear down the current physical leg. Any pending `read` returns
    /// `ReadError::Fatal`.
    fn kill(&self);

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

//! Relink -- a reliable, ordered logical connection over a lossy physical
//! substrate that may replace its leg at any time.
//!
//! Each connection runs two tasks:
//! - **Receive loop**: decodes frames, drops duplicates and out-of-order
//!   chunks, requests resends with Sync, acknowledges with Ack, and hands
//!   in-order payloads to `Conn::read`.
//! - **Send loop**: writes control messages and buffered chunks through the
//!   current physical writer, switching writers when the substrate stitches.
//!
//! Outgoing chunks stay in a retransmission buffer until the peer
//! acknowledges them, so a lost frame or a stitched leg costs a resend, not
//! the connection.

pub mod buffer;
pub mod conn;
pub mod error;
pub mod frame;
pub mod mem;
pub mod recv;
mod send;
mod signal;
pub mod substrate;

// Re-export key public types at crate root.
pub use buffer::{Buffer, Outbox};
pub use conn::{Conn, ConnConfig, ConnectionState};
pub use error::{RelinkError, Result};
pub use frame::{Codec, Message, MessageKind, SeqNo, WireCodec};
pub use recv::{ChunkOutcome, RecvState};
pub use substrate::{LegWriter, ReadError, Substrate};

//! Line-delimited JSON IPC with worker processes.
//!
//! - `codec`: one JSON object per line, envelope classification
//! - `multiplexer`: correlation ids, pending requests, timeouts

pub mod codec;
pub mod multiplexer;

pub use codec::{decode_line, encode_line, Envelope, MessageKind, WireProtocol};
pub use multiplexer::{LineOutcome, LineWriter, Multiplexer, MultiplexerStats, TimeoutPolicy};

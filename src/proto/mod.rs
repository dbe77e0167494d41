//! Queen/drone wire contracts
//!
//! Every field is a fixed-size, native byte order transfer. The only framing is
//! the length prefix in front of a result record.

pub mod record;
pub mod wire;

pub use record::{encode_all, Record};
pub use wire::{Field, ProtocolError, Release};

//! Arbor wire protocol.
//!
//! Arbor servers and clients exchange newline-delimited JSON objects over a
//! byte stream. Every object carries a `command` field naming the message
//! type; the full catalogue is the [`Frame`] enum, so unknown commands and
//! missing required fields are rejected at decode time rather than deep in a
//! handler.
//!
//! # Modules
//!
//! - [`frame`] - the message catalogue and directory snapshot DTOs
//! - [`codec`] - [`FrameCodec`], a `tokio_util` codec producing one [`Frame`]
//!   per line with a configurable length guard

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_LENGTH};
pub use frame::{
    DeliverySnapshot, DirectorySnapshot, Frame, MessageSnapshot, PeerInfo, RecordKindSnapshot,
    RecordSnapshot,
};

//! Wire layer shared by the coordinator and worker programs.
//!
//! # Architecture
//!
//! - **frame**: `StateFrame`, the flat key/value message
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **protocol**: handshake and tick field names

pub mod codec;
pub mod frame;
pub mod protocol;

pub use codec::{FrameCodec, FrameError, decode, encode};
pub use frame::{Scalar, StateFrame};
pub use protocol::Handshake;

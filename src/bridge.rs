//! The bridging protocol: wire frames, the datagram channel pair, and the
//! per-thread-class multiplexer contexts shared by both endpoints.

pub mod channel;
pub mod context;
pub mod frame;

pub use channel::BridgeChannel;
pub use context::{ChannelContext, Endpoint};
pub use frame::{Cmd, Frame, PluginData, CHUNK_BYTES};

/// Errors produced by the channel and protocol layer. Everything here is
/// fatal to the endpoint loop that encounters it; opcode-level failures
/// travel through the opcodes' own return values instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The peer shut down its end of the channel. An orderly occurrence
    /// during teardown, fatal at any other time.
    #[error("bridge channel closed by peer")]
    Closed,

    #[error("bridge channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame arrived that does not describe a valid message.
    #[error("malformed frame: {0}")]
    BadFrame(&'static str),

    /// A frame arrived with a command value outside the protocol's closed
    /// set.
    #[error("unknown bridge command {0}")]
    UnknownCmd(u32),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

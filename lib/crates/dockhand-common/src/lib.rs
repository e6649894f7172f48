pub mod channels;
pub mod config;
pub mod envelope;
pub mod payloads;

pub use channels::{
    command_channel, command_stream, heartbeat_channel, reply_channel, reply_stream,
    validate_server_key, ReplyRoute,
};
pub use config::TransportMode;
pub use envelope::{Envelope, EnvelopeError, MessageType, PROTOCOL_VERSION};
pub use payloads::*;

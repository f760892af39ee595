//! Live view client for Nexus camera relays.
//!
//! The library speaks the relay protocol and manages the encoder process;
//! the `nexus-streamer` binary wires it to environment configuration.

pub mod modules;

pub use modules::nexus::{
    NexusStreamer, PrepareStreamRequest, PrepareStreamResponse, StopReason, StreamRequest,
    StreamerConfig, StreamerError, StreamerEvent,
};

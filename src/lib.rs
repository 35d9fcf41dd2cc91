//! # zmqruntime
//!
//! A dual-channel execution and streaming runtime built on ZeroMQ
//! sockets. Servers bind a data socket (PUB, SUB or PULL) on a chosen
//! port and a REP control socket at `port + offset`; clients discover
//! servers with a ping handshake, adopt running ones or spawn their own,
//! submit jobs over the control channel, and receive progress on the data
//! channel. Viewers acknowledge consumed images out of band on a shared
//! PULL port, feeding per-viewer queue trackers.

pub mod ack;
pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod messages;
pub mod process;
pub mod server;
pub mod tracker;
pub mod transport;
pub mod utils;

pub use ack::AckListener;
pub use client::execution::{ExecutionClient, ExecutionOutcome, TaskSerializer};
pub use client::{ClientCore, CommandSpawner, DiscoveredServer, ServerSpawner};
pub use config::{RuntimeConfig, TransportMode};
pub use errors::{RequestTimeout, TaskError};
pub use messages::{
    ControlRequest, ControlResponse, ExecuteRequest, ExecutionRecord, ExecutionStatus, ImageAck,
    OkReply, PongResponse, ProgressUpdate, ResultsSummary,
};
pub use server::execution::{
    register_execution_server, ExecutionContext, ExecutionServer, TaskExecutor, TaskOutput,
};
pub use server::streaming::{ImageSink, StreamingServer};
pub use server::{
    create_server, register_server_type, run_server, DataSocketKind, RuntimeServer, ServerCore,
    ServerOptions,
};
pub use tracker::{QueueTracker, TrackerRegistry};

/// The current version of the runtime crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Tether wire layer: request/response messaging between processes.
//!
//! ## Architecture
//!
//! - **Message**: JSON envelope, length-prefixed on byte streams
//! - **ChannelProxy / ChannelHostProxy**: transport abstractions, with
//!   in-memory and stream (TCP, Unix socket, child stdio) implementations
//! - **Communicator**: correlates requests with responses and routes incoming
//!   requests by path pattern
//! - **CommunicationHost**: one communicator per accepted connection, with a
//!   host-wide route table
//! - **connect**: opens a communicator from serialized connection info

pub mod channel;
pub mod communicator;
pub mod connect;
pub mod host;
pub mod ipc;
pub mod memory;
pub mod message;
pub mod pattern;
pub mod stream;

pub use channel::{ChannelHandler, ChannelHostHandler, ChannelHostProxy, ChannelProxy, WireError};
pub use communicator::{Communicator, RequestHandler};
pub use connect::{connect, ChannelInitializers};
pub use host::{CommunicationHost, HostListener};
pub use memory::{MemoryChannel, MemoryChannelHost};
pub use message::Message;
pub use pattern::{PathInfo, RegexPattern, RoutePattern, StringPattern};
pub use stream::{StreamChannel, StreamChannelHost};

//! WebSocket bridge for IMU camera trackers.
//!
//! A small RFC 6455 server (`net`) running on its own I/O thread, plus the
//! tracking layer that maps incoming IMU samples onto camera poses.

pub mod config;
pub mod error;
pub mod net;
pub mod tracking;

pub use config::ServerConfig;
pub use error::{ConfigError, EncodingError, FrameError, HandshakeError, ServerError, TrackingError};
pub use net::connection::{ConnectionId, Message};
pub use net::delivery::{delivery_queue, Delivery, DeliveryQueue, DeliveryReceiver};
pub use net::server::{on_text, start, Handler, Peers, Server, ServerHandle};

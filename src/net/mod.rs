pub mod connection;
pub mod delivery;
pub mod framing;
pub mod handshake;
pub mod server;
pub mod tcp_opt;

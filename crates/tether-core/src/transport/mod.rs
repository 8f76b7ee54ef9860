//! Network transports implementing [`Channel`](crate::Channel).

pub mod frame;
mod tcp;

pub use tcp::{TcpChannel, TcpChannelServer};

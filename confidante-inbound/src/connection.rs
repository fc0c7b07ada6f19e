//! [`Connection`](confidante_core::xmpp::stream::Connection) implementations for
//! real sockets, plus a debug wrapper that records traffic to disk.

pub mod debug;
pub mod tcp;

//! The router link: the single outbound connection from a c2s process to
//! its session manager, plus the in-process table that routes stanzas
//! between that link and locally-terminated connections.

pub mod router;

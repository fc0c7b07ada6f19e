//! Server-to-server dialback: establishing outbound connections to peer
//! domains and answering the third-party verification requests that
//! come with them.

pub mod dialback;

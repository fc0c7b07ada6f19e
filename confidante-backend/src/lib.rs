//! Storage and configuration for the session manager process: the
//! password/session store backends and the [`settings::Settings`] layer
//! that wires together every other crate's configuration.

pub mod settings;
pub mod store;

pub mod karma;
pub mod rate;
pub mod utils;
pub mod xml;
pub mod xmpp;

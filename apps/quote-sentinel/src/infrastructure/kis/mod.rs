//! KIS Open API Integration
//!
//! REST quotation transport and streaming tick feed for the Korea
//! Investment & Securities Open API, plus the auth, codec, and
//! reconnection machinery both share.

pub mod auth;
pub mod codec;
pub mod messages;
pub mod reconnect;
pub mod stream;
pub mod transport;

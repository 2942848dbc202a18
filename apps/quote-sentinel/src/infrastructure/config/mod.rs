//! Configuration Module
//!
//! Configuration loading for the sentinel service.

mod settings;

pub use settings::{
    AlertSettings, ConfigError, Credentials, Environment, HotSetSettings, ScanSettings,
    SentinelConfig, ServerSettings, SignalSettings, StoreSettings, StreamSettings,
    TransportSettings,
};

//! Application layer: the ingestion pipeline and the ports it drives.

pub mod pipeline;
pub mod ports;
pub mod scanner;

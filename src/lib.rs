//! intercom_duplex - full-duplex voice pipeline with latency-aligned echo
//! cancellation.

pub mod audio;
pub mod config;
pub mod simulation;

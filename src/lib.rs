//! Flowgate - an access-controlled gateway in front of a supervised local server
//!
//! This library provides:
//! - A reverse proxy that admits callers by network address, holding unknown
//!   callers for approval and refusing blocked ones
//! - Transparent tunnelling of upgraded connections (WebSocket and friends)
//! - Supervision of the backend process: start, stop, hard restart, exit
//!   classification and log capture
//! - Download, verification and installation of the backend runtime
//! - A watchdog that restarts crashed backends with backoff and trips on
//!   repeated proxy failures
//! - A loopback admin API for approvals and lifecycle control

pub mod access;
pub mod admin;
pub mod config;
pub mod environment;
pub mod error;
pub mod logs;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod runtime;
pub mod secrets;
pub mod shutdown;
pub mod watchdog;

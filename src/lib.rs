//! speedcheck measures latency, jitter, download and upload throughput
//! against a speed test server.
//!
//! The engine ([`engine::SpeedTest`]) runs four steps in sequence: IP
//! discovery, latency, download and upload. Each measurement step runs
//! several concurrent transfer streams, over HTTP requests or WebSockets,
//! and publishes cumulative results to its host through
//! [`messaging::Messenger`].

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod host;
pub mod messaging;
pub mod output;
pub mod results;
pub mod retry;
pub mod stats;
pub mod status;
pub mod transport;

pub use config::Config;
pub use engine::SpeedTest;
pub use errors::SpeedTestError;
pub use status::{Status, Step};

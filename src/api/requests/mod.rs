pub mod config;
pub mod ip;
pub mod save;

pub use config::ConfigRequest;
pub use ip::{IpInfo, IpRequest};
pub use save::SaveResult;

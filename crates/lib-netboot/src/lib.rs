//! All-in-one network boot appliance: DHCP/ProxyDHCP with iPXE
//! chainloading, read-only TFTP with option negotiation, minimal HTTP
//! GET/HEAD, and an NBD export with optional copy-on-write overlays.
//!
//! Every service resolves file names through [`fs::normalize`] under a
//! single boot directory and is started as a peer task by
//! [`server::run`].

pub mod config;
pub mod constants;
pub mod dhcp;
pub mod fs;
pub mod http;
pub mod nbd;
pub mod server;
pub mod tftp;

pub use config::*;
pub use server::{run, ServerConfig, ServerError};

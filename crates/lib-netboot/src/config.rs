//! Plain configuration records consumed by the services. Defaults follow
//! the classic netboot appliance conventions (192.168.2.0/24, lease range
//! .100-.150).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::constants;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    /// Address the server identifies itself as (option 54).
    pub server_ip: Ipv4Addr,
    pub port: u16,
    pub offer_from: Ipv4Addr,
    pub offer_to: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
    /// Destination for OFFER/ACK replies. When unset, the directed
    /// broadcast of `server_ip`/`subnet_mask` is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Ipv4Addr>,
    /// Where clients fetch the boot file from (siaddr, option 66).
    pub file_server: Ipv4Addr,
    /// Boot file name handed out in option 67. Wrapped into a
    /// `tftp://`/`http://` URL at service construction when iPXE is on.
    pub file_name: String,
    /// Set when the operator named the boot file explicitly; disables
    /// architecture-based file name selection.
    pub force_file_name: bool,
    pub lease_time: u32,
    pub proxy: bool,
    /// Ignore clients that have no static binding.
    pub whitelist: bool,
    pub ipxe: bool,
    pub http: bool,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            server_ip: Ipv4Addr::new(192, 168, 2, 2),
            port: constants::DHCP_SERVER_PORT,
            offer_from: Ipv4Addr::new(192, 168, 2, 100),
            offer_to: Ipv4Addr::new(192, 168, 2, 150),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Ipv4Addr::new(192, 168, 2, 1),
            dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            broadcast: None,
            file_server: Ipv4Addr::new(192, 168, 2, 2),
            file_name: String::new(),
            force_file_name: false,
            lease_time: constants::DEFAULT_LEASE_SECS,
            proxy: false,
            whitelist: false,
            ipxe: false,
            http: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Retransmissions before a silent client is dropped.
    pub retries: u32,
    /// Seconds to wait for an ACK before retransmitting.
    pub timeout: u64,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: constants::TFTP_PORT,
            retries: 3,
            timeout: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::UNSPECIFIED,
            port: constants::HTTP_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    /// Path of the exported image, relative to the boot directory. This
    /// is also the export name clients must request. Empty disables the
    /// service.
    pub block_device: String,
    pub write: bool,
    /// Divert writes into a per-client overlay instead of the image.
    pub cow: bool,
    /// Keep the overlay in memory instead of an on-disk file.
    pub cow_in_mem: bool,
    /// Load the whole image into memory at startup and serve reads from
    /// there. Only honored in copy-on-write modes.
    pub copy_to_ram: bool,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            block_device: String::new(),
            write: false,
            cow: true,
            cow_in_mem: false,
            copy_to_ram: false,
            ip: Ipv4Addr::UNSPECIFIED,
            port: constants::NBD_PORT,
        }
    }
}

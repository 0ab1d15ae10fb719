use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use netboot::config::{DhcpConfig, HttpConfig, NbdConfig, TftpConfig};
use netboot::dhcp::StaticBindings;
use netboot::server::ServerConfig;

use crate::cli::Cli;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error while reading TOML config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("error while deserializing TOML: {0}")]
    Deserialize(#[from] toml::de::Error),

    #[error("error while serializing TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Service toggles; everything else in the document configures a
/// service that may or may not end up enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Services {
    pub dhcp: bool,
    pub dhcp_proxy: bool,
    pub tftp: bool,
    pub http: bool,
    pub ipxe: bool,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            dhcp: false,
            dhcp_proxy: false,
            tftp: true,
            http: false,
            ipxe: false,
        }
    }
}

/// The configuration document: built-in defaults, overridden by the
/// TOML file, overridden by command line flags. Also the shape that
/// `--dump-config` prints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub netboot_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netboot_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_config: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_leases: Option<PathBuf>,
    pub debug: String,
    pub verbose: String,
    pub services: Services,
    pub dhcp: DhcpConfig,
    pub tftp: TftpConfig,
    pub http: HttpConfig,
    pub nbd: NbdConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            netboot_dir: PathBuf::from("netboot"),
            netboot_file: None,
            static_config: None,
            save_leases: None,
            debug: String::new(),
            verbose: String::new(),
            services: Services::default(),
            dhcp: DhcpConfig::default(),
            tftp: TftpConfig::default(),
            http: HttpConfig::default(),
            nbd: NbdConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Overlay the command line; explicit flags beat the file.
    pub fn merge_cli(&mut self, cli: &Cli) {
        if cli.ipxe {
            self.services.ipxe = true;
        } else if cli.no_ipxe {
            self.services.ipxe = false;
        }
        if cli.http {
            self.services.http = true;
        } else if cli.no_http {
            self.services.http = false;
        }
        if cli.tftp {
            self.services.tftp = true;
        } else if cli.no_tftp {
            self.services.tftp = false;
        }
        if cli.dhcp {
            self.services.dhcp = true;
        }
        if cli.dhcp_proxy {
            self.services.dhcp_proxy = true;
        }

        if let Some(dir) = &cli.netboot_dir {
            self.netboot_dir = dir.clone();
        }
        if let Some(file) = &cli.netboot_file {
            self.netboot_file = Some(file.clone());
        }
        if let Some(path) = &cli.static_config {
            self.static_config = Some(path.clone());
        }
        if let Some(path) = &cli.save_leases {
            self.save_leases = Some(path.clone());
        }
        if let Some(tags) = &cli.debug {
            self.debug = tags.clone();
        }
        if let Some(tags) = &cli.verbose {
            self.verbose = tags.clone();
        }

        if let Some(ip) = cli.dhcp_server_ip {
            self.dhcp.server_ip = ip;
        }
        if let Some(port) = cli.dhcp_server_port {
            self.dhcp.port = port;
        }
        if let Some(ip) = cli.dhcp_begin {
            self.dhcp.offer_from = ip;
        }
        if let Some(ip) = cli.dhcp_end {
            self.dhcp.offer_to = ip;
        }
        if let Some(mask) = cli.dhcp_subnet {
            self.dhcp.subnet_mask = mask;
        }
        if let Some(ip) = cli.dhcp_router {
            self.dhcp.router = ip;
        }
        if let Some(ip) = cli.dhcp_dns {
            self.dhcp.dns = vec![ip];
        }
        if let Some(ip) = cli.dhcp_broadcast {
            self.dhcp.broadcast = Some(ip);
        }
        if let Some(ip) = cli.dhcp_fileserver {
            self.dhcp.file_server = ip;
        }
        if cli.dhcp_whitelist {
            self.dhcp.whitelist = true;
        }

        if let Some(ip) = cli.http_server_ip {
            self.http.ip = ip;
        }
        if let Some(port) = cli.http_port {
            self.http.port = port;
        }
        if let Some(ip) = cli.tftp_server_ip {
            self.tftp.ip = ip;
        }

        if let Some(device) = &cli.nbd {
            self.nbd.block_device = device.clone();
        }
        if cli.nbd_write {
            self.nbd.write = true;
        }
        if cli.nbd_cow {
            self.nbd.cow = true;
        }
        if cli.nbd_cow_in_mem {
            self.nbd.cow_in_mem = true;
        }
        if cli.nbd_copy_to_ram {
            self.nbd.copy_to_ram = true;
        }
        if let Some(ip) = cli.nbd_server {
            self.nbd.ip = ip;
        }
        if let Some(port) = cli.nbd_port {
            self.nbd.port = port;
        }
    }

    /// Resolve the derived settings and produce the supervisor's
    /// configuration. Static bindings are loaded here, before the
    /// supervisor confines the process to the boot directory.
    pub fn build(mut self) -> anyhow::Result<ServerConfig> {
        if self.services.dhcp_proxy {
            self.services.dhcp = true;
        }

        // When the boot file was not named explicitly it follows from
        // the enabled services, and architecture-based selection stays
        // available.
        let (file_name, force_file_name) = match self.netboot_file.clone() {
            Some(name) => (name, true),
            None => {
                let name = if !self.services.ipxe {
                    "pxelinux.0"
                } else if !self.services.http {
                    "boot.ipxe"
                } else {
                    "boot.http.ipxe"
                };
                (name.to_string(), false)
            }
        };

        let statics = match &self.static_config {
            Some(path) => StaticBindings::load(path)?,
            None => StaticBindings::default(),
        };

        let dhcp = if self.services.dhcp {
            let mut dhcp = self.dhcp.clone();
            dhcp.file_name = file_name;
            dhcp.force_file_name = force_file_name;
            dhcp.proxy = self.services.dhcp_proxy;
            dhcp.ipxe = self.services.ipxe;
            dhcp.http = self.services.http;
            Some(dhcp)
        } else {
            None
        };

        Ok(ServerConfig {
            netboot_dir: self.netboot_dir,
            dhcp,
            tftp: self.services.tftp.then_some(self.tftp),
            http: self.services.http.then_some(self.http),
            nbd: (!self.nbd.block_device.is_empty()).then_some(self.nbd),
            statics,
            leases_file: self.save_leases,
        })
    }
}

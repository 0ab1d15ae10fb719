use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

/// All-in-one PXE network boot server: DHCP, TFTP, HTTP and NBD in one
/// process.
#[derive(Debug, Parser)]
#[command(name = "emberd", version)]
pub struct Cli {
    /// Enable iPXE chainloading
    #[arg(long, overrides_with = "no_ipxe")]
    pub ipxe: bool,

    /// Disable iPXE chainloading
    #[arg(long)]
    pub no_ipxe: bool,

    /// Enable the built-in HTTP server
    #[arg(long, overrides_with = "no_http")]
    pub http: bool,

    /// Disable the built-in HTTP server
    #[arg(long)]
    pub no_http: bool,

    /// Enable the built-in TFTP server (enabled by default)
    #[arg(long, overrides_with = "no_tftp")]
    pub tftp: bool,

    /// Disable the built-in TFTP server
    #[arg(long)]
    pub no_tftp: bool,

    /// Enable the built-in DHCP server
    #[arg(long)]
    pub dhcp: bool,

    /// Enable the built-in DHCP server in ProxyDHCP mode (implies --dhcp)
    #[arg(long, conflicts_with = "dhcp")]
    pub dhcp_proxy: bool,

    /// Comma separated service tags (dhcp,tftp,http,nbd) to run with
    /// debug logging; 'all' selects every service, a leading '-'
    /// excludes one (e.g. 'all,-dhcp')
    #[arg(long, value_name = "TAGS")]
    pub debug: Option<String>,

    /// Same tag list as --debug, at the less chatty verbose level
    #[arg(long, value_name = "TAGS")]
    pub verbose: Option<String>,

    /// Load defaults from a TOML file; command line flags win
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the built-in defaults as a valid config file and exit
    #[arg(long)]
    pub dump_config: bool,

    /// Like --dump-config, but with the file and command line merged in
    #[arg(long)]
    pub dump_config_merged: bool,

    /// Static DHCP bindings from a JSON file
    #[arg(long, value_name = "PATH")]
    pub static_config: Option<PathBuf>,

    /// Save DHCP leases here on exit and SIGHUP; loaded back on start
    #[arg(long, value_name = "PATH")]
    pub save_leases: Option<PathBuf>,

    /// Local directory to serve boot files from
    #[arg(long, value_name = "DIR")]
    pub netboot_dir: Option<PathBuf>,

    /// PXE boot file name (after iPXE if --ipxe)
    #[arg(long, value_name = "FILE")]
    pub netboot_file: Option<String>,

    /// DHCP server IP
    #[arg(long, value_name = "IP")]
    pub dhcp_server_ip: Option<Ipv4Addr>,

    /// DHCP server port
    #[arg(long, value_name = "PORT")]
    pub dhcp_server_port: Option<u16>,

    /// DHCP lease range start
    #[arg(long, value_name = "IP")]
    pub dhcp_begin: Option<Ipv4Addr>,

    /// DHCP lease range end
    #[arg(long, value_name = "IP")]
    pub dhcp_end: Option<Ipv4Addr>,

    /// DHCP lease subnet mask
    #[arg(long, value_name = "MASK")]
    pub dhcp_subnet: Option<Ipv4Addr>,

    /// DHCP lease router
    #[arg(long, value_name = "IP")]
    pub dhcp_router: Option<Ipv4Addr>,

    /// DHCP lease DNS server
    #[arg(long, value_name = "IP")]
    pub dhcp_dns: Option<Ipv4Addr>,

    /// DHCP broadcast destination
    #[arg(long, value_name = "IP")]
    pub dhcp_broadcast: Option<Ipv4Addr>,

    /// DHCP file server IP (next-server)
    #[arg(long, value_name = "IP")]
    pub dhcp_fileserver: Option<Ipv4Addr>,

    /// Only answer DHCP clients present in --static-config
    #[arg(long)]
    pub dhcp_whitelist: bool,

    /// HTTP server IP
    #[arg(long, value_name = "IP")]
    pub http_server_ip: Option<Ipv4Addr>,

    /// HTTP server port
    #[arg(long, value_name = "PORT")]
    pub http_port: Option<u16>,

    /// TFTP server IP
    #[arg(long, value_name = "IP")]
    pub tftp_server_ip: Option<Ipv4Addr>,

    /// Enable the NBD server with this block device (a disk image path
    /// relative to --netboot-dir)
    #[arg(long, value_name = "DEVICE")]
    pub nbd: Option<String>,

    /// Allow writes on the NBD device
    #[arg(long)]
    pub nbd_write: bool,

    /// Copy-on-write for the NBD device (non-persistent changes)
    #[arg(long)]
    pub nbd_cow: bool,

    /// Keep copy-on-write pages in memory
    #[arg(long)]
    pub nbd_cow_in_mem: bool,

    /// Copy the NBD device into memory before serving clients
    #[arg(long)]
    pub nbd_copy_to_ram: bool,

    /// NBD server IP
    #[arg(long, value_name = "IP")]
    pub nbd_server: Option<Ipv4Addr>,

    /// NBD server port
    #[arg(long, value_name = "PORT")]
    pub nbd_port: Option<u16>,
}

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
pub const TFTP_PORT: u16 = 69;
pub const HTTP_PORT: u16 = 80;
pub const NBD_PORT: u16 = 10809;

pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

/// BOOTP replies are padded up to this many bytes.
pub const MIN_DHCP_PACKET_SIZE: usize = 300;

pub const HARDWARE_TYPE_ETHERNET: u8 = 1;
pub const HARDWARE_ADDR_LEN_ETHERNET: u8 = 6;

pub const DEFAULT_LEASE_SECS: u32 = 86_400;

/// TFTP transfer block size when the client does not negotiate one.
pub const TFTP_DEFAULT_BLKSIZE: usize = 512;

/// Copy-on-write overlays capture the source in pages of this size.
pub const COW_PAGE_SIZE: usize = 4096;

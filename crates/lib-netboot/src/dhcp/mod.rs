//! DHCP/ProxyDHCP service, limited to the options PXE firmware needs.
//!
//! Implemented from RFC 2131/2132 and the Intel PXE specification. In
//! proxy mode no addresses are assigned; the server only contributes the
//! boot file name, next-server and the PXE vendor block next to the
//! network's real DHCP server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, SystemTime};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::DhcpConfig;
use crate::constants;

pub mod leases;
pub mod message;
pub mod options;

pub use leases::{Lease, LeaseStore, Mac, StaticBinding, StaticBindings};
pub use message::{Message, MessageError};
pub use options::MessageType;

use options::{tag, tlv};

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ran out of IP addresses to lease")]
    OutOfLeases,
}

/// Invoked when the expected hostname shows up in a request, indicating
/// the awaited machine finished booting into its OS.
pub struct BootNotification {
    pub hostname: String,
    pub callback: Box<dyn Fn(Ipv4Addr) + Send + Sync>,
}

pub struct DhcpService {
    cfg: DhcpConfig,
    /// Effective boot file name, after iPXE URL wrapping.
    file_name: String,
    leases: LeaseStore,
    statics: StaticBindings,
    notify: Option<BootNotification>,
}

impl DhcpService {
    pub fn new(cfg: DhcpConfig, statics: StaticBindings, leases: LeaseStore) -> Self {
        if cfg.http && !cfg.ipxe {
            warn!("HTTP selected but iPXE disabled. PXE ROM must support HTTP requests.");
        }

        let file_name = if cfg.ipxe && cfg.http {
            format!("http://{}/{}", cfg.file_server, cfg.file_name)
        } else if cfg.ipxe {
            format!("tftp://{}/{}", cfg.file_server, cfg.file_name)
        } else {
            cfg.file_name.clone()
        };

        Self {
            cfg,
            file_name,
            leases,
            statics,
            notify: None,
        }
    }

    pub fn with_boot_notification(mut self, notify: BootNotification) -> Self {
        self.notify = Some(notify);
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DhcpError> {
        let socket = self.bind_socket()?;
        let reply_to = SocketAddr::from((self.broadcast_addr(), constants::DHCP_CLIENT_PORT));
        info!(
            port = self.cfg.port,
            proxy = self.cfg.proxy,
            "DHCP server listening"
        );
        debug!(
            from = %self.cfg.offer_from,
            to = %self.cfg.offer_to,
            file = %self.file_name,
            "lease range and boot file"
        );

        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, src) = received?;
                    if let Some(reply) = self.process(&buf[..len], src) {
                        if let Err(err) = socket.send_to(&reply, reply_to).await {
                            warn!("failed to send reply to {reply_to}: {err}");
                        }
                    }
                }
            }
        }
        info!("DHCP server stopped");
        Ok(())
    }

    fn bind_socket(&self) -> Result<UdpSocket, DhcpError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.cfg.port));
        socket.bind(&address.into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Replies go to the directed broadcast of the serving subnet unless
    /// the operator configured a destination.
    fn broadcast_addr(&self) -> Ipv4Addr {
        self.cfg.broadcast.unwrap_or_else(|| {
            let ip = u32::from(self.cfg.server_ip);
            let mask = u32::from(self.cfg.subnet_mask);
            Ipv4Addr::from((ip & mask) | !mask)
        })
    }

    /// Handle one received datagram and craft the reply, if any.
    fn process(&self, raw: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        let msg = match Message::parse(raw) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("dropping unparseable packet from {src}: {err}");
                return None;
            }
        };
        let mac = msg.mac();

        // Seed the lease entry so the chainload state exists for this
        // client from the first packet on.
        self.leases.update(mac, self.cfg.ipxe, |_| ());

        if let Some(notify) = &self.notify {
            if msg.options.hostname() == Some(notify.hostname.as_bytes()) {
                if let Some(ip) = msg.options.requested_ip() {
                    (notify.callback)(ip);
                }
            }
        }

        if self.cfg.whitelist && !self.statics.contains(mac) {
            debug!("ignoring non-whitelisted client {mac}");
            return None;
        }

        // Only PXE firmware is served.
        let vendor_class = msg.options.vendor_class()?;
        if !contains_subsequence(vendor_class, b"PXEClient") {
            debug!("ignoring non-PXE request from {mac}");
            return None;
        }

        let kind = match msg.options.message_type()? {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => {
                let from_unspecified = src.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED);
                // A fresh client requests from 0.0.0.0; a proxy answer is
                // only warranted once the real DHCP server gave it an
                // address.
                if from_unspecified == self.cfg.proxy {
                    return None;
                }
                MessageType::Ack
            }
            _ => return None,
        };

        match self.build_reply(&msg, kind) {
            Ok(reply) => {
                debug!(%mac, xid = msg.xid, "sending {:?}", kind);
                Some(reply)
            }
            Err(DhcpError::OutOfLeases) => {
                error!("ran out of leases answering {mac}");
                None
            }
            Err(err) => {
                warn!("failed to build reply for {mac}: {err}");
                None
            }
        }
    }

    fn build_reply(&self, msg: &Message, kind: MessageType) -> Result<Vec<u8>, DhcpError> {
        let mut out = Vec::with_capacity(constants::MIN_DHCP_PACKET_SIZE);
        self.craft_header(msg, &mut out)?;
        self.craft_options(msg, kind, &mut out);
        // BOOTP minimum size padding
        while out.len() < constants::MIN_DHCP_PACKET_SIZE {
            out.push(0);
        }
        Ok(out)
    }

    /// The fixed 236-byte reply header plus the magic cookie.
    fn craft_header(&self, msg: &Message, out: &mut Vec<u8>) -> Result<(), DhcpError> {
        out.extend_from_slice(&[
            2, // BOOTREPLY
            constants::HARDWARE_TYPE_ETHERNET,
            constants::HARDWARE_ADDR_LEN_ETHERNET,
            0,
        ]);
        out.extend_from_slice(&msg.xid.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // secs
        let flags: u16 = if self.cfg.proxy { 0x8000 } else { 0 };
        out.extend_from_slice(&flags.to_be_bytes());
        out.extend_from_slice(&[0; 4]); // ciaddr

        // yiaddr
        if self.cfg.proxy {
            out.extend_from_slice(&[0; 4]);
        } else {
            let ip = self.assign(msg.mac())?;
            out.extend_from_slice(&ip.octets());
        }

        // siaddr
        if self.cfg.proxy {
            out.extend_from_slice(&[0; 4]);
        } else {
            out.extend_from_slice(&self.cfg.file_server.octets());
        }

        out.extend_from_slice(&[0; 4]); // giaddr
        out.extend_from_slice(&msg.chaddr);
        out.extend_from_slice(&[0; 64]); // sname

        // The legacy file field only carries the boot file in proxy mode;
        // regular clients read option 67 instead.
        if self.cfg.proxy {
            let name = self.file_name.as_bytes();
            let n = name.len().min(128);
            out.extend_from_slice(&name[..n]);
            out.resize(out.len() + (128 - n), 0);
        } else {
            out.extend_from_slice(&[0; 128]);
        }

        out.extend_from_slice(&constants::MAGIC_COOKIE);
        Ok(())
    }

    /// Confirm the client's current address or hand out a fresh one.
    fn assign(&self, mac: Mac) -> Result<Ipv4Addr, DhcpError> {
        let now = SystemTime::now();
        let current = self
            .leases
            .get(mac)
            .filter(|lease| !lease.expired(now))
            .and_then(|lease| lease.ip);

        let ip = match current {
            Some(ip) => ip,
            None => match self.statics.get(mac).and_then(|binding| binding.ipaddr) {
                Some(ip) => ip,
                None => self.next_ip(now)?,
            },
        };

        self.leases.update(mac, self.cfg.ipxe, |lease| {
            if lease.ip != Some(ip) {
                debug!("new assignment {mac} -> {ip}");
            }
            lease.ip = Some(ip);
            lease.expires_at = now + Duration::from_secs(u64::from(self.cfg.lease_time));
        });
        Ok(ip)
    }

    /// First address in `[offer_from, offer_to)` that is neither leased
    /// nor of the X.Y.Z.0 form. Expired leases are reclaimed implicitly
    /// because only unexpired ones count as taken.
    fn next_ip(&self, now: SystemTime) -> Result<Ipv4Addr, DhcpError> {
        let leased = self.leases.leased_ips(now);
        let from = u32::from(self.cfg.offer_from);
        let to = u32::from(self.cfg.offer_to);
        for candidate in from..to {
            if candidate % 256 == 0 {
                continue;
            }
            let ip = Ipv4Addr::from(candidate);
            if !leased.contains(&ip) {
                return Ok(ip);
            }
        }
        Err(DhcpError::OutOfLeases)
    }

    /// The TLV option block (RFC 2132 section 9.6).
    fn craft_options(&self, msg: &Message, kind: MessageType, out: &mut Vec<u8>) {
        let mac = msg.mac();
        let binding = self.statics.get(mac);

        tlv(out, tag::DHCP_MESSAGE_TYPE, &[kind.as_u8()]);
        tlv(out, tag::SERVER_IDENTIFIER, &self.cfg.server_ip.octets());

        if !self.cfg.proxy {
            let subnet = binding
                .and_then(|b| b.subnet)
                .unwrap_or(self.cfg.subnet_mask);
            tlv(out, tag::SUBNET_MASK, &subnet.octets());

            let router = binding.and_then(|b| b.router).unwrap_or(self.cfg.router);
            tlv(out, tag::ROUTER, &router.octets());

            let dns = binding
                .filter(|b| !b.dns.is_empty())
                .map(|b| b.dns.as_slice())
                .unwrap_or(&self.cfg.dns);
            if !dns.is_empty() {
                let addrs: Vec<u8> = dns.iter().flat_map(|ip| ip.octets()).collect();
                tlv(out, tag::DOMAIN_NAME_SERVER, &addrs);
            }

            tlv(out, tag::IP_ADDR_LEASE_TIME, &self.cfg.lease_time.to_be_bytes());
        }

        tlv(
            out,
            tag::TFTP_SERVER_NAME,
            self.cfg.file_server.to_string().as_bytes(),
        );

        let chainload = self.cfg.ipxe
            && self
                .leases
                .get(mac)
                .map(|lease| lease.ipxe_pending)
                .unwrap_or(self.cfg.ipxe);

        if chainload {
            // Serve the stub once; the loaded iPXE re-enters DHCP and
            // gets the real file name on its pass.
            tlv(out, tag::BOOTFILE_NAME, b"chainload.kpxe\0");
            if kind == MessageType::Ack {
                self.leases.update(mac, self.cfg.ipxe, |lease| {
                    lease.ipxe_pending = false;
                });
            }
        } else {
            let name = match (msg.options.client_arch(), self.cfg.force_file_name) {
                (Some(0), false) => "pxelinux.0",
                (Some(6), false) => "syslinux.efi32",
                // EFI BC reports 7 but is x86-64 in practice, same as 9
                (Some(7), false) | (Some(9), false) => "syslinux.efi64",
                _ => self.file_name.as_str(),
            };
            let mut value = Vec::with_capacity(name.len() + 1);
            value.extend_from_slice(name.as_bytes());
            value.push(0);
            tlv(out, tag::BOOTFILE_NAME, &value);
        }

        if self.cfg.proxy {
            tlv(out, tag::VENDOR_CLASS_IDENTIFIER, b"PXEClient");
            // PXE discovery control: no multicast/broadcast discovery,
            // boot straight from the offered server, then the boot server
            // suffix.
            out.extend_from_slice(&[
                tag::VENDOR_SPECIFIC,
                10,
                6,
                1,
                0b1000,
                10,
                4,
                0,
                b'P',
                b'X',
                b'E',
                0xff,
            ]);
        }

        out.push(tag::END);
    }
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];

    fn request_packet(mac: [u8; 6], message_type: u8, extra_options: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 240];
        buf[0] = 1;
        buf[1] = 1;
        buf[2] = 6;
        buf[4..8].copy_from_slice(&0xdead_beefu32.to_be_bytes());
        buf[28..34].copy_from_slice(&mac);
        buf[236..240].copy_from_slice(&constants::MAGIC_COOKIE);
        buf.extend_from_slice(&[53, 1, message_type]);
        buf.extend_from_slice(&[60, 9]);
        buf.extend_from_slice(b"PXEClient");
        buf.extend_from_slice(extra_options);
        buf.push(255);
        buf
    }

    fn reply_options(reply: &[u8]) -> HashMap<u8, Vec<u8>> {
        let mut found = HashMap::new();
        let mut raw = &reply[240..];
        while let [tag, rest @ ..] = raw {
            match *tag {
                0 => raw = rest,
                255 => break,
                other => {
                    let len = rest[0] as usize;
                    found.insert(other, rest[1..1 + len].to_vec());
                    raw = &rest[1 + len..];
                }
            }
        }
        found
    }

    fn discover_src() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 68))
    }

    fn service(cfg: DhcpConfig) -> DhcpService {
        DhcpService::new(cfg, StaticBindings::default(), LeaseStore::new())
    }

    fn default_cfg() -> DhcpConfig {
        DhcpConfig {
            file_name: "pxelinux.0".into(),
            ..DhcpConfig::default()
        }
    }

    #[test]
    fn discover_yields_default_offer() {
        let svc = service(default_cfg());
        let reply = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();

        assert!(reply.len() >= constants::MIN_DHCP_PACKET_SIZE);
        assert_eq!(reply[0], 2);
        assert_eq!(&reply[4..8], &0xdead_beefu32.to_be_bytes());
        // yiaddr is the first address of the range
        assert_eq!(&reply[16..20], &[192, 168, 2, 100]);
        // siaddr is the file server
        assert_eq!(&reply[20..24], &[192, 168, 2, 2]);
        assert_eq!(&reply[28..34], &MAC);

        let options = reply_options(&reply);
        assert_eq!(options[&53], vec![2]);
        assert_eq!(options[&54], vec![192, 168, 2, 2]);
        assert_eq!(options[&1], vec![255, 255, 255, 0]);
        assert_eq!(options[&3], vec![192, 168, 2, 1]);
        assert_eq!(options[&6], vec![8, 8, 8, 8]);
        assert_eq!(options[&51], 86_400u32.to_be_bytes().to_vec());
        assert_eq!(options[&66], b"192.168.2.2".to_vec());
        assert_eq!(options[&67], b"pxelinux.0\0".to_vec());
    }

    #[test]
    fn arch_option_selects_the_efi_loader() {
        let svc = service(default_cfg());
        let reply = svc
            .process(
                &request_packet(MAC, 1, &[93, 2, 0x00, 0x07]),
                discover_src(),
            )
            .unwrap();
        assert_eq!(reply_options(&reply)[&67], b"syslinux.efi64\0".to_vec());

        let reply = svc
            .process(
                &request_packet(MAC, 1, &[93, 2, 0x00, 0x06]),
                discover_src(),
            )
            .unwrap();
        assert_eq!(reply_options(&reply)[&67], b"syslinux.efi32\0".to_vec());
    }

    #[test]
    fn forced_file_name_wins_over_arch() {
        let cfg = DhcpConfig {
            file_name: "custom.efi".into(),
            force_file_name: true,
            ..DhcpConfig::default()
        };
        let svc = service(cfg);
        let reply = svc
            .process(
                &request_packet(MAC, 1, &[93, 2, 0x00, 0x07]),
                discover_src(),
            )
            .unwrap();
        assert_eq!(reply_options(&reply)[&67], b"custom.efi\0".to_vec());
    }

    #[test]
    fn ipxe_chainload_is_one_shot() {
        let cfg = DhcpConfig {
            file_name: "boot.ipxe".into(),
            ipxe: true,
            http: false,
            ..DhcpConfig::default()
        };
        let svc = service(cfg);

        // first pass: the chainload stub
        let offer = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();
        assert_eq!(reply_options(&offer)[&67], b"chainload.kpxe\0".to_vec());

        // the ACK still carries the stub and disarms the flag
        let ack = svc
            .process(&request_packet(MAC, 3, &[]), discover_src())
            .unwrap();
        assert_eq!(reply_options(&ack)[&67], b"chainload.kpxe\0".to_vec());

        // second pass: the wrapped real file name
        let offer = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();
        assert_eq!(
            reply_options(&offer)[&67],
            b"tftp://192.168.2.2/boot.ipxe\0".to_vec()
        );
    }

    #[test]
    fn ipxe_with_http_wraps_as_http_url() {
        let cfg = DhcpConfig {
            file_name: "boot.http.ipxe".into(),
            ipxe: true,
            http: true,
            ..DhcpConfig::default()
        };
        let svc = service(cfg);
        assert_eq!(svc.file_name, "http://192.168.2.2/boot.http.ipxe");
    }

    #[test]
    fn proxy_reply_shape() {
        let cfg = DhcpConfig {
            file_name: "pxelinux.0".into(),
            proxy: true,
            ..DhcpConfig::default()
        };
        let svc = service(cfg);
        let reply = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();

        // broadcast flag set, no addresses assigned
        assert_eq!(&reply[10..12], &0x8000u16.to_be_bytes());
        assert_eq!(&reply[16..20], &[0, 0, 0, 0]);
        assert_eq!(&reply[20..24], &[0, 0, 0, 0]);
        // the legacy file field carries the boot file
        assert_eq!(&reply[108..118], b"pxelinux.0");

        let options = reply_options(&reply);
        assert_eq!(options[&60], b"PXEClient".to_vec());
        assert_eq!(options[&43], vec![6, 1, 8, 10, 4, 0, b'P', b'X', b'E', 0xff]);
        assert!(!options.contains_key(&1));
        assert!(!options.contains_key(&51));
    }

    #[test]
    fn request_gating_by_source_address() {
        let svc = service(default_cfg());
        // fresh client requesting from 0.0.0.0 gets an ACK
        let ack = svc.process(&request_packet(MAC, 3, &[]), discover_src());
        assert!(ack.is_some());
        assert_eq!(reply_options(&ack.unwrap())[&53], vec![5]);

        // a renewing client with a source address belongs to the real
        // DHCP server in non-proxy deployments
        let src = SocketAddr::from(([192, 168, 2, 100], 68));
        assert!(svc.process(&request_packet(MAC, 3, &[]), src).is_none());
    }

    #[test]
    fn non_pxe_requests_are_dropped() {
        let svc = service(default_cfg());
        let mut buf = vec![0u8; 240];
        buf[0] = 1;
        buf[28..34].copy_from_slice(&MAC);
        buf[236..240].copy_from_slice(&constants::MAGIC_COOKIE);
        buf.extend_from_slice(&[53, 1, 1, 255]);
        assert!(svc.process(&buf, discover_src()).is_none());
    }

    #[test]
    fn whitelist_drops_unknown_clients() {
        let cfg = DhcpConfig {
            file_name: "pxelinux.0".into(),
            whitelist: true,
            ..DhcpConfig::default()
        };
        let svc = service(cfg);
        assert!(svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .is_none());
    }

    #[test]
    fn static_binding_overrides_allocation() {
        let mut map = HashMap::new();
        map.insert(
            "AA:BB:CC:DD:EE:01".to_string(),
            StaticBinding {
                ipaddr: Some(Ipv4Addr::new(192, 168, 2, 222)),
                router: Some(Ipv4Addr::new(192, 168, 2, 254)),
                ..Default::default()
            },
        );
        let svc = DhcpService::new(
            default_cfg(),
            StaticBindings::from_map(map),
            LeaseStore::new(),
        );
        let reply = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();
        assert_eq!(&reply[16..20], &[192, 168, 2, 222]);
        assert_eq!(reply_options(&reply)[&3], vec![192, 168, 2, 254]);
    }

    #[test]
    fn allocation_is_stable_and_unique() {
        let svc = service(default_cfg());
        let first = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();
        let second_mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];
        let second = svc
            .process(&request_packet(second_mac, 1, &[]), discover_src())
            .unwrap();
        let again = svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .unwrap();

        assert_eq!(&first[16..20], &[192, 168, 2, 100]);
        assert_eq!(&second[16..20], &[192, 168, 2, 101]);
        assert_eq!(&again[16..20], &[192, 168, 2, 100]);
    }

    #[test]
    fn next_ip_skips_addresses_ending_in_zero() {
        let cfg = DhcpConfig {
            offer_from: Ipv4Addr::new(192, 168, 1, 254),
            offer_to: Ipv4Addr::new(192, 168, 2, 5),
            ..default_cfg()
        };
        let svc = service(cfg);
        let first = svc.next_ip(SystemTime::now()).unwrap();
        assert_eq!(first, Ipv4Addr::new(192, 168, 1, 254));

        svc.leases.update(MAC.into(), false, |lease| {
            lease.ip = Some(first);
            lease.expires_at = SystemTime::now() + Duration::from_secs(60);
        });
        svc.leases
            .update([0, 0, 0, 0, 0, 2].into(), false, |lease| {
                lease.ip = Some(Ipv4Addr::new(192, 168, 1, 255));
                lease.expires_at = SystemTime::now() + Duration::from_secs(60);
            });
        // 192.168.2.0 must be skipped
        assert_eq!(
            svc.next_ip(SystemTime::now()).unwrap(),
            Ipv4Addr::new(192, 168, 2, 1)
        );
    }

    #[test]
    fn exhausted_range_drops_the_packet() {
        let cfg = DhcpConfig {
            offer_from: Ipv4Addr::new(192, 168, 2, 100),
            offer_to: Ipv4Addr::new(192, 168, 2, 101),
            ..default_cfg()
        };
        let svc = service(cfg);
        let other = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];
        assert!(svc
            .process(&request_packet(other, 1, &[]), discover_src())
            .is_some());
        assert!(svc
            .process(&request_packet(MAC, 1, &[]), discover_src())
            .is_none());
    }

    #[test]
    fn boot_notification_fires_on_hostname_match() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_callback = seen.clone();
        let svc = service(default_cfg()).with_boot_notification(BootNotification {
            hostname: "node1".into(),
            callback: Box::new(move |ip| {
                assert_eq!(ip, Ipv4Addr::new(192, 168, 2, 130));
                seen_in_callback.fetch_add(1, Ordering::SeqCst);
            }),
        });

        let mut extra = vec![12, 5];
        extra.extend_from_slice(b"node1");
        extra.extend_from_slice(&[50, 4, 192, 168, 2, 130]);
        svc.process(&request_packet(MAC, 1, &extra), discover_src());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

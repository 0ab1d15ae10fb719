//! Received DHCP message parsing.
//!
//! The fixed packet layout (RFC 2131 section 2) is 236 bytes of header
//! followed by the 4-byte magic cookie and the TLV option block. Only
//! fields the server consults are retained; `sname`/`file` from requests
//! are never read.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::constants;
use crate::dhcp::leases::Mac;
use crate::dhcp::options::OptionMap;

/// Offset of the option block, right after the magic cookie.
const OPTIONS_OFFSET: usize = 240;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("packet too short for a DHCP message ({0} bytes)")]
    Truncated(usize),

    #[error("missing magic cookie")]
    BadCookie,
}

#[derive(Debug)]
pub struct Message {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub options: OptionMap,
}

impl Message {
    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < OPTIONS_OFFSET {
            return Err(MessageError::Truncated(buf.len()));
        }
        if buf[236..240] != constants::MAGIC_COOKIE {
            return Err(MessageError::BadCookie);
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);

        Ok(Self {
            op: buf[0],
            htype: buf[1],
            hlen: buf[2],
            hops: buf[3],
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            secs: u16::from_be_bytes([buf[8], buf[9]]),
            flags: u16::from_be_bytes([buf[10], buf[11]]),
            ciaddr: ipv4_at(buf, 12),
            yiaddr: ipv4_at(buf, 16),
            siaddr: ipv4_at(buf, 20),
            giaddr: ipv4_at(buf, 24),
            chaddr,
            options: OptionMap::parse(&buf[OPTIONS_OFFSET..]),
        })
    }

    /// First six bytes of `chaddr`; Ethernet is all PXE firmware speaks.
    pub fn mac(&self) -> Mac {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        Mac(mac)
    }
}

fn ipv4_at(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

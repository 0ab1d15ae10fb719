//! The lease table, static bindings and the snapshot file.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// A client hardware address. Displays and parses as the uppercase
/// colon-separated form used in static binding files and logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mac(pub [u8; 6]);

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<[u8; 6]> for Mac {
    fn from(raw: [u8; 6]) -> Self {
        Mac(raw)
    }
}

#[derive(Debug, Error)]
#[error("invalid hardware address {0:?}")]
pub struct MacParseError(String);

impl FromStr for Mac {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| MacParseError(s.into()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| MacParseError(s.into()))?;
        }
        if parts.next().is_some() {
            return Err(MacParseError(s.into()));
        }
        Ok(Mac(bytes))
    }
}

#[derive(Debug, Clone)]
pub struct Lease {
    pub ip: Option<Ipv4Addr>,
    pub expires_at: SystemTime,
    /// The iPXE chainload stub still has to be served to this client.
    pub ipxe_pending: bool,
}

impl Lease {
    fn fresh(ipxe_pending: bool) -> Self {
        Self {
            ip: None,
            expires_at: UNIX_EPOCH,
            ipxe_pending,
        }
    }

    pub fn expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

/// One snapshot line. Extra fields in older files deserialize into
/// nothing and are ignored.
#[derive(Serialize, Deserialize)]
struct LeaseRecord {
    mac: String,
    #[serde(default)]
    ip: Option<Ipv4Addr>,
    #[serde(default)]
    expires: u64,
    #[serde(default)]
    ipxe: bool,
}

/// Lease table shared between the DHCP task (which is the only mutator)
/// and the supervisor (which snapshots it).
#[derive(Clone, Default)]
pub struct LeaseStore {
    inner: Arc<Mutex<HashMap<Mac, Lease>>>,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a line-oriented snapshot. Unparseable lines are skipped with
    /// a warning so a damaged file never blocks startup.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let store = Self::new();
        let contents = std::fs::read_to_string(path.as_ref())?;
        {
            let mut table = store.inner.lock().unwrap();
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                let record: LeaseRecord = match serde_json::from_str(line) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!("skipping unreadable lease snapshot line: {err}");
                        continue;
                    }
                };
                let mac = match record.mac.parse::<Mac>() {
                    Ok(mac) => mac,
                    Err(err) => {
                        warn!("skipping lease snapshot line: {err}");
                        continue;
                    }
                };
                table.insert(
                    mac,
                    Lease {
                        ip: record.ip,
                        expires_at: UNIX_EPOCH + Duration::from_secs(record.expires),
                        ipxe_pending: record.ipxe,
                    },
                );
            }
        }
        Ok(store)
    }

    /// Rewrite the snapshot, one JSON object per line, ordered by MAC so
    /// consecutive snapshots diff cleanly.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut lines = Vec::new();
        {
            let table = self.inner.lock().unwrap();
            for (mac, lease) in table.iter() {
                let record = LeaseRecord {
                    mac: mac.to_string(),
                    ip: lease.ip,
                    expires: lease
                        .expires_at
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    ipxe: lease.ipxe_pending,
                };
                // in-memory serialization of plain fields cannot fail
                if let Ok(line) = serde_json::to_string(&record) {
                    lines.push(line);
                }
            }
        }
        lines.sort();
        let mut contents = lines.join("\n");
        contents.push('\n');
        std::fs::write(path.as_ref(), contents)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, mac: Mac) -> Option<Lease> {
        self.inner.lock().unwrap().get(&mac).cloned()
    }

    /// Make sure an entry exists, then let `apply` mutate it. Returns
    /// whatever `apply` produces.
    pub fn update<T>(&self, mac: Mac, ipxe_default: bool, apply: impl FnOnce(&mut Lease) -> T) -> T {
        let mut table = self.inner.lock().unwrap();
        let lease = table.entry(mac).or_insert_with(|| Lease::fresh(ipxe_default));
        apply(lease)
    }

    /// Addresses currently held by unexpired leases.
    pub fn leased_ips(&self, now: SystemTime) -> HashSet<Ipv4Addr> {
        let table = self.inner.lock().unwrap();
        table
            .values()
            .filter(|lease| !lease.expired(now))
            .filter_map(|lease| lease.ip)
            .collect()
    }
}

/// Per-MAC overrides loaded from the static configuration file: a JSON
/// object keyed by the uppercase colon-separated hardware address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticBinding {
    pub ipaddr: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Addr>,
    pub router: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
pub struct StaticBindings {
    entries: HashMap<String, StaticBinding>,
}

impl StaticBindings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StaticConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let entries: HashMap<String, StaticBinding> = serde_json::from_str(&contents)?;
        Ok(Self::from_map(entries))
    }

    pub fn from_map(entries: HashMap<String, StaticBinding>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(mac, binding)| (mac.to_uppercase(), binding))
                .collect(),
        }
    }

    pub fn get(&self, mac: Mac) -> Option<&StaticBinding> {
        self.entries.get(&mac.to_string())
    }

    pub fn contains(&self, mac: Mac) -> bool {
        self.entries.contains_key(&mac.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum StaticConfigError {
    #[error("cannot read static configuration: {0}")]
    Read(#[from] std::io::Error),

    #[error("static configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

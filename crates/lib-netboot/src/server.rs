//! The supervisor: confines the process to the boot directory, builds
//! the enabled services and runs each as a peer task until the first
//! one stops or an interrupt arrives.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{DhcpConfig, HttpConfig, NbdConfig, TftpConfig};
use crate::dhcp::{DhcpError, DhcpService, LeaseStore, StaticBindings};
use crate::http::{HttpError, HttpService};
use crate::nbd::{NbdError, NbdService};
use crate::tftp::{TftpError, TftpService};

/// Effective configuration the binary hands over after flag/file
/// merging: one record per enabled service plus the shared pieces.
pub struct ServerConfig {
    /// Boot directory; becomes the working directory (and, where
    /// permitted, the chroot) before any service binds.
    pub netboot_dir: PathBuf,
    pub dhcp: Option<DhcpConfig>,
    pub tftp: Option<TftpConfig>,
    pub http: Option<HttpConfig>,
    pub nbd: Option<NbdConfig>,
    pub statics: StaticBindings,
    /// Lease snapshot, restored on start and rewritten on SIGHUP and on
    /// clean shutdown.
    pub leases_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            netboot_dir: PathBuf::from("netboot"),
            dhcp: None,
            tftp: None,
            http: None,
            nbd: None,
            statics: StaticBindings::default(),
            leases_file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DHCP service failed: {0}")]
    Dhcp(#[from] DhcpError),

    #[error("TFTP service failed: {0}")]
    Tftp(#[from] TftpError),

    #[error("HTTP service failed: {0}")]
    Http(#[from] HttpError),

    #[error("NBD service failed: {0}")]
    Nbd(#[from] NbdError),
}

pub async fn run(mut cfg: ServerConfig) -> Result<(), ServerError> {
    if !nix::unistd::geteuid().is_root() {
        warn!("not running as root, services will probably fail to bind");
    }

    // Resolve the snapshot path before confinement so it stays writable
    // from inside the boot directory.
    let leases_file = match cfg.leases_file.take() {
        Some(path) if path.is_absolute() => Some(path),
        Some(path) => Some(std::env::current_dir()?.join(path)),
        None => None,
    };

    std::env::set_current_dir(&cfg.netboot_dir)?;
    // The chroot is advisory; the path guard stays load-bearing either
    // way.
    match nix::unistd::chroot(".") {
        Ok(()) => debug!("chrooted into {}", cfg.netboot_dir.display()),
        Err(err) => warn!("cannot chroot into the boot directory ({err}), continuing without"),
    }

    let leases = match &leases_file {
        Some(path) if path.exists() => match LeaseStore::load(path) {
            Ok(store) => {
                info!("restored {} leases from {}", store.len(), path.display());
                store
            }
            Err(err) => {
                warn!("cannot restore leases from {}: {err}", path.display());
                LeaseStore::new()
            }
        },
        _ => LeaseStore::new(),
    };

    if cfg.http.is_some() && cfg.dhcp.is_none() {
        warn!("HTTP enabled without the DHCP service; PXE ROMs must support HTTP on their own");
    }

    if let Some(nbd) = cfg.nbd.as_mut() {
        if nbd.write && !nbd.cow {
            warn!("NBD write enabled but copy-on-write is not; multiple clients may corrupt the image");
        }
        if nbd.cow_in_mem || nbd.copy_to_ram {
            warn!("NBD in-memory overlays and copy-to-RAM can use a lot of memory");
        }
        if nbd.cow && !nbd.write {
            // cow implies write
            nbd.write = true;
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut services: JoinSet<Result<(), ServerError>> = JoinSet::new();

    if let Some(tftp_cfg) = cfg.tftp.take() {
        info!("starting TFTP server...");
        let service = TftpService::bind(tftp_cfg, ".").await?;
        let stop = stop_rx.clone();
        services.spawn(async move { service.run(stop).await.map_err(ServerError::from) });
    }

    if let Some(dhcp_cfg) = cfg.dhcp.take() {
        if dhcp_cfg.proxy {
            info!("starting DHCP server in ProxyDHCP mode...");
        } else {
            info!("starting DHCP server...");
        }
        let statics = std::mem::take(&mut cfg.statics);
        let service = DhcpService::new(dhcp_cfg, statics, leases.clone());
        let stop = stop_rx.clone();
        services.spawn(async move { service.run(stop).await.map_err(ServerError::from) });
    }

    if let Some(http_cfg) = cfg.http.take() {
        info!("starting HTTP server...");
        let service = HttpService::bind(http_cfg, ".").await?;
        let stop = stop_rx.clone();
        services.spawn(async move { service.run(stop).await.map_err(ServerError::from) });
    }

    if let Some(nbd_cfg) = cfg.nbd.take() {
        info!("starting NBD server...");
        let service = NbdService::bind(nbd_cfg, ".").await?;
        let stop = stop_rx.clone();
        services.spawn(async move { service.run(stop).await.map_err(ServerError::from) });
    }

    if services.is_empty() {
        warn!("no services enabled, nothing to do");
        return Ok(());
    }
    info!("appliance up and running");

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            finished = services.join_next() => {
                match finished {
                    Some(Ok(Ok(()))) => info!("a service stopped, shutting down"),
                    Some(Ok(Err(err))) => error!("service failed: {err}"),
                    Some(Err(err)) => error!("service task panicked: {err}"),
                    None => {}
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = hangup.recv() => {
                if let Some(path) = &leases_file {
                    snapshot_leases(&leases, path);
                }
            }
        }
    }

    // Cooperative shutdown first, the hard way only for stragglers.
    let _ = stop_tx.send(true);
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), services.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                warn!("services did not stop in time, aborting them");
                services.abort_all();
                break;
            }
        }
    }

    if let Some(path) = &leases_file {
        snapshot_leases(&leases, path);
    }
    Ok(())
}

fn snapshot_leases(leases: &LeaseStore, path: &Path) {
    match leases.save(path) {
        Ok(()) => info!("saved {} leases to {}", leases.len(), path.display()),
        Err(err) => warn!("cannot save leases to {}: {err}", path.display()),
    }
}

//! `VmHandle`: owns one Firecracker process and everything it needs —
//! control socket, private rootfs copy, tap device, guest IP — and
//! drives the VM start sequence.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::network::{NetworkFabric, TapError};

use super::api::{ApiError, FirecrackerClient};
use super::config::{
    self, generate_mac_address, BootSource, DriveConfig, MachineConfig, NetworkInterface,
};
use super::readiness::{self, ReadinessError};

/// How many times to poll for the control socket to appear, at what
/// interval, before giving up.
const SOCKET_POLL_ATTEMPTS: usize = 50;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SOCKET_SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum VmHandleError {
    #[error("firecracker process failed to spawn: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("control socket did not appear at {0}")]
    SocketNeverAppeared(String),

    #[error("failed to copy rootfs from {from} to {to}: {source}")]
    RootfsCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tap(#[from] TapError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

/// Static parameters needed to build and start a VM; shared across every
/// handle in the pool.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub golden_rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
    pub firecracker_path: PathBuf,
    pub mem_size_mib: u32,
    pub vcpu_count: u8,
}

/// One provisioned guest. `available` is
/// deliberately not a field here: that bit of state belongs to the pool,
/// not the handle itself.
pub struct VmHandle {
    pub id: String,
    pub control_socket_path: PathBuf,
    pub guest_ip: String,
    pub tap_name: String,
    pub rootfs_path: PathBuf,
    pool_index: usize,

    process: Option<Child>,
    client: FirecrackerClient,
}

impl VmHandle {
    /// Build and start a new handle at pool index `pool_index`, bound to
    /// `guest_ip` and tap `tap_name`. Runs the full Start protocol
    /// on any failure, rolling back everything it already
    /// allocated and returns the error.
    pub async fn start(
        id: String,
        pool_index: usize,
        guest_ip: String,
        tap_name: String,
        spec: &VmSpec,
        fabric: &Arc<NetworkFabric>,
    ) -> Result<Self, VmHandleError> {
        let rootfs_path = config::rootfs_path(&id);
        copy_file(&spec.golden_rootfs_path, &rootfs_path)?;

        if let Err(e) = fabric.create_tap(&tap_name) {
            let _ = std::fs::remove_file(&rootfs_path);
            return Err(e.into());
        }

        match Self::boot(&id, pool_index, &guest_ip, &tap_name, &rootfs_path, spec).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                let _ = fabric.delete_tap(&tap_name);
                let _ = std::fs::remove_file(&rootfs_path);
                Err(e)
            }
        }
    }

    async fn boot(
        id: &str,
        pool_index: usize,
        guest_ip: &str,
        tap_name: &str,
        rootfs_path: &PathBuf,
        spec: &VmSpec,
    ) -> Result<Self, VmHandleError> {
        let control_socket_path = config::control_socket_path(id);
        let log_path = config::log_path(id);

        let process = spawn_hypervisor(&spec.firecracker_path, id, &control_socket_path, &log_path)
            .await?;

        wait_for_socket(&control_socket_path).await?;

        let client = FirecrackerClient::new(&control_socket_path);

        let result = Self::configure_and_start(
            &client,
            pool_index,
            guest_ip,
            tap_name,
            rootfs_path,
            spec,
            id,
        )
        .await;

        let mut process = process;
        if let Err(e) = result {
            let _ = process.start_kill();
            let _ = process.wait().await;
            let _ = std::fs::remove_file(&control_socket_path);
            let _ = std::fs::remove_file(&log_path);
            return Err(e);
        }

        Ok(Self {
            id: id.to_string(),
            control_socket_path,
            guest_ip: guest_ip.to_string(),
            tap_name: tap_name.to_string(),
            rootfs_path: rootfs_path.clone(),
            pool_index,
            process: Some(process),
            client,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn configure_and_start(
        client: &FirecrackerClient,
        pool_index: usize,
        guest_ip: &str,
        tap_name: &str,
        rootfs_path: &PathBuf,
        spec: &VmSpec,
        id: &str,
    ) -> Result<(), VmHandleError> {
        let boot_source = BootSource::new(spec.kernel_path.clone(), pool_index);
        client.put_boot_source(&boot_source).await?;

        let drive = DriveConfig::rootfs(rootfs_path.clone());
        client.put_rootfs_drive(&drive).await?;

        let machine = MachineConfig::new(spec.vcpu_count, spec.mem_size_mib);
        client.put_machine_config(&machine).await?;

        let mac = generate_mac_address(id);
        let nic = NetworkInterface::eth0(tap_name, mac);
        client.put_network_interface(&nic).await?;

        client.start_instance().await?;

        readiness::wait_until_ready(guest_ip).await?;

        info!(id, guest_ip, tap = tap_name, "VM ready");
        Ok(())
    }

    /// Re-establish that the guest is still live. No in-guest mutation —
    /// just a readiness re-probe.
    pub async fn reset(&self) -> Result<(), VmHandleError> {
        readiness::wait_until_ready(&self.guest_ip)
            .await
            .map_err(Into::into)
    }

    pub fn pool_index(&self) -> usize {
        self.pool_index
    }

    /// Kill and reap the hypervisor process, then remove the control
    /// socket, rootfs copy, and log file. Idempotent.
    pub async fn stop(&mut self, fabric: &Arc<NetworkFabric>) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.start_kill() {
                warn!(id = %self.id, error = %e, "failed to signal firecracker process");
            }
            let _ = process.wait().await;
        }

        let _ = std::fs::remove_file(&self.control_socket_path);
        let _ = std::fs::remove_file(config::log_path(&self.id));
        let _ = std::fs::remove_file(&self.rootfs_path);

        if let Err(e) = fabric.delete_tap(&self.tap_name) {
            warn!(id = %self.id, tap = %self.tap_name, error = %e, "failed to delete tap on stop");
        }

        info!(id = %self.id, "VM handle stopped and reclaimed");
    }
}

async fn spawn_hypervisor(
    firecracker_path: &PathBuf,
    id: &str,
    socket_path: &PathBuf,
    log_path: &PathBuf,
) -> Result<Child, VmHandleError> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }

    let log_file = std::fs::File::create(log_path).map_err(VmHandleError::Spawn)?;
    let log_file_err = log_file.try_clone().map_err(VmHandleError::Spawn)?;

    Command::new(firecracker_path)
        .arg("--api-sock")
        .arg(socket_path)
        .arg("--id")
        .arg(id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()
        .map_err(VmHandleError::Spawn)
}

async fn wait_for_socket(socket_path: &PathBuf) -> Result<(), VmHandleError> {
    for _ in 0..SOCKET_POLL_ATTEMPTS {
        if socket_path.exists() {
            sleep(SOCKET_SETTLE_DELAY).await;
            return Ok(());
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }

    Err(VmHandleError::SocketNeverAppeared(
        socket_path.display().to_string(),
    ))
}

fn copy_file(from: &PathBuf, to: &PathBuf) -> Result<(), VmHandleError> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|source| VmHandleError::RootfsCopy {
            from: from.clone(),
            to: to.clone(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_poll_contract() {
        assert_eq!(SOCKET_POLL_ATTEMPTS, 50);
        assert_eq!(SOCKET_POLL_INTERVAL, Duration::from_millis(100));
        assert_eq!(SOCKET_SETTLE_DELAY, Duration::from_millis(100));
    }

    #[test]
    fn test_copy_file_reports_source_and_dest_on_failure() {
        let from = PathBuf::from("/nonexistent/rootfs.ext4");
        let to = PathBuf::from("/tmp/doesnt-matter.ext4");
        let err = copy_file(&from, &to).unwrap_err();
        match err {
            VmHandleError::RootfsCopy { from: f, to: t, .. } => {
                assert_eq!(f, from);
                assert_eq!(t, to);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}

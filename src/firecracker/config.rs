//! Wire types for the Firecracker control-socket API.
//!
//! These map directly onto the JSON bodies accepted by
//! `PUT /boot-source`, `PUT /drives/rootfs`, `PUT /machine-config`, and
//! `PUT /network-interfaces/eth0`.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// `PUT /machine-config` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

impl MachineConfig {
    pub fn new(vcpu_count: u8, mem_size_mib: u32) -> Self {
        Self {
            vcpu_count,
            mem_size_mib,
            smt: Some(false),
        }
    }
}

/// `PUT /boot-source` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

impl BootSource {
    /// Build the boot source for pool-index `vm_index`. The cmdline
    /// uses the minimum: `console=ttyS0 reboot=k panic=1 pci=off
    /// vm_id=<index> init=/init`.
    pub fn new(kernel_image_path: impl Into<PathBuf>, vm_index: usize) -> Self {
        Self {
            kernel_image_path: kernel_image_path.into(),
            boot_args: Some(format!(
                "console=ttyS0 reboot=k panic=1 pci=off vm_id={vm_index} init=/init"
            )),
        }
    }
}

/// `PUT /drives/rootfs` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl DriveConfig {
    /// The handle's private, writable rootfs copy, mounted as the root
    /// device.
    pub fn rootfs(path: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// `PUT /network-interfaces/eth0` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

impl NetworkInterface {
    pub fn eth0(tap_name: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            iface_id: "eth0".to_string(),
            host_dev_name: tap_name.into(),
            guest_mac: Some(mac.into()),
        }
    }
}

/// `PUT /actions` body.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceAction {
    pub action_type: &'static str,
}

impl InstanceAction {
    pub fn instance_start() -> Self {
        Self {
            action_type: "InstanceStart",
        }
    }
}

/// Generate a locally-administered MAC, distinct per VM with
/// overwhelming probability: first octet's LSB-of-upper-nibble
/// set to `0x02`, the remaining five octets taken from a high-resolution
/// time source mixed with the VM id. Adequate because MACs are only ever
/// visible on the private host bridge.
pub fn generate_mac_address(vm_id: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut seed = nanos as u64;
    for byte in vm_id.as_bytes() {
        seed = seed.wrapping_mul(1_099_511_628_211).wrapping_add(*byte as u64);
    }

    let first = ((seed >> 40) as u8 & 0xFC) | 0x02;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        first,
        (seed >> 32) as u8,
        (seed >> 24) as u8,
        (seed >> 16) as u8,
        (seed >> 8) as u8,
        seed as u8,
    )
}

pub fn control_socket_path(id: &str) -> PathBuf {
    Path::new("/tmp").join(format!("firecracker-{id}.sock"))
}

pub fn log_path(id: &str) -> PathBuf {
    Path::new("/tmp").join(format!("firecracker-{id}.log"))
}

pub fn rootfs_path(id: &str) -> PathBuf {
    Path::new("/tmp").join(format!("rootfs-{id}.ext4"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_args_contain_required_tokens() {
        let boot = BootSource::new("/kernel/vmlinux", 2);
        let args = boot.boot_args.unwrap();
        assert!(args.contains("console=ttyS0"));
        assert!(args.contains("reboot=k"));
        assert!(args.contains("panic=1"));
        assert!(args.contains("pci=off"));
        assert!(args.contains("vm_id=2"));
        assert!(args.contains("init=/init"));
    }

    #[test]
    fn test_rootfs_drive_is_root_and_writable() {
        let drive = DriveConfig::rootfs("/tmp/rootfs-abc.ext4");
        assert!(drive.is_root_device);
        assert!(!drive.is_read_only);
        assert_eq!(drive.drive_id, "rootfs");
    }

    #[test]
    fn test_generate_mac_is_locally_administered_and_distinct() {
        let mac1 = generate_mac_address("vm-1");
        let mac2 = generate_mac_address("vm-2");
        assert_ne!(mac1, mac2);

        let first_octet = u8::from_str_radix(&mac1[0..2], 16).unwrap();
        assert_eq!(first_octet & 0x02, 0x02);
        assert_eq!(mac1.len(), 17);
    }

    #[test]
    fn test_well_known_paths() {
        assert_eq!(
            control_socket_path("abc"),
            PathBuf::from("/tmp/firecracker-abc.sock")
        );
        assert_eq!(log_path("abc"), PathBuf::from("/tmp/firecracker-abc.log"));
        assert_eq!(rootfs_path("abc"), PathBuf::from("/tmp/rootfs-abc.ext4"));
    }
}

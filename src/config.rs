//! Configuration for the sandbox pool daemon.

use std::path::PathBuf;

use anyhow::Result;

/// Pool daemon configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the host HTTP listener binds to.
    pub api_port: u16,

    /// Port the in-guest agent listens on (used to build the guest URL).
    pub agent_port: u16,

    /// Path to the golden rootfs image, copied per VM.
    pub rootfs_path: PathBuf,

    /// Path to the kernel image.
    pub kernel_path: PathBuf,

    /// Number of warm VMs to keep in the pool.
    pub pool_size: usize,

    /// First three octets of the private guest subnet, e.g. `172.16.0`.
    pub network_prefix: String,

    /// Memory given to each microVM, in MiB.
    pub mem_size_mib: u32,

    /// vCPUs given to each microVM.
    pub vcpu_count: u8,

    /// Path to the firecracker binary.
    pub firecracker_path: PathBuf,

    /// Name of the pre-provisioned host bridge device.
    pub bridge_name: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// compiled-in defaults for anything not set.
    pub fn from_env() -> Result<Self> {
        let api_port = std::env::var("API_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8000);

        let agent_port = std::env::var("AGENT_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let rootfs_path = std::env::var("ROOTFS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./rootfs/rootfs.ext4"));

        let kernel_path = std::env::var("KERNEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./kernel/vmlinux"));

        let pool_size = std::env::var("POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);

        let network_prefix =
            std::env::var("NETWORK_PREFIX").unwrap_or_else(|_| "172.16.0".to_string());

        let mem_size_mib = std::env::var("VM_MEM_SIZE_MIB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256);

        let vcpu_count = std::env::var("VM_VCPU_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let firecracker_path = std::env::var("FIRECRACKER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/bin/firecracker"));

        let bridge_name = std::env::var("BRIDGE_NAME").unwrap_or_else(|_| "fcbridge".to_string());

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            api_port,
            agent_port,
            rootfs_path,
            kernel_path,
            pool_size,
            network_prefix,
            mem_size_mib,
            vcpu_count,
            firecracker_path,
            bridge_name,
            log_level,
        })
    }

    /// The assigned guest IP for the VM at the given pool index.
    pub fn guest_ip(&self, index: usize) -> String {
        format!("{}.{}", self.network_prefix, 100 + index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_ip_from_prefix() {
        let mut config = Config::from_env().unwrap();
        config.network_prefix = "172.16.0".to_string();
        assert_eq!(config.guest_ip(0), "172.16.0.100");
        assert_eq!(config.guest_ip(3), "172.16.0.103");
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.agent_port, 8080);
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.bridge_name, "fcbridge");
    }
}

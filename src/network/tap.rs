//! TAP device creation and management for the host bridge.
//!
//! Every microVM gets a dedicated host-side tap device enslaved to the
//! well-known bridge (`fcbridge` by default). Tap naming and creation race
//! against other processes on the host that might also be managing
//! `fc-tap-*` devices, so every mutating operation is serialized through a
//! single process-wide mutex and retried once on "device or resource busy".
//!
//! Assumes a single instance of this service owns `fc-tap-*` naming on the
//! host; a filesystem lock would be needed to extend that guarantee across
//! processes.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on tap-name candidates scanned by `create_tap_auto`.
const MAX_AUTO_CANDIDATES: usize = 4096;

/// Minimum number of candidates `create_tap_auto` must be willing to try
/// before giving up, per the fabric's concurrency contract.
const MIN_AUTO_CANDIDATES: usize = 64;

/// Errors from network fabric operations.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("bridge {0} does not exist; expected it to be pre-provisioned")]
    BridgeMissing(String),

    #[error("failed to create tap device {name}: {message}")]
    CreateFailed { name: String, message: String },

    #[error("failed to delete tap device {name}: {message}")]
    DeleteFailed { name: String, message: String },

    #[error("exhausted {0} candidate tap names without finding a free one")]
    NamesExhausted(usize),

    #[error("privileged command failed: {0}")]
    CommandFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Runs a privileged `ip` invocation. The escalation mechanism (sudo,
/// setcap, a root-owned helper binary, ...) is a host concern; this trait
/// is the seam that keeps it out of the fabric's logic.
pub trait PrivilegedRunner: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<(), TapError>;
}

/// Default runner: shells out to `sudo -n ip <args>`.
pub struct SudoRunner;

impl PrivilegedRunner for SudoRunner {
    fn run(&self, args: &[&str]) -> Result<(), TapError> {
        let output = Command::new("sudo")
            .arg("-n")
            .arg("ip")
            .args(args)
            .output()?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(TapError::CommandFailed(format!(
                "ip {}: {}",
                args.join(" "),
                stderr
            )))
        }
    }
}

/// Host network fabric: verifies the bridge and manages tap devices.
///
/// Stateless aside from the serialization mutex — safe to share across
/// every VM handle as `Arc<NetworkFabric>`.
pub struct NetworkFabric {
    bridge_name: String,
    runner: Box<dyn PrivilegedRunner>,
    creation_lock: Mutex<()>,
}

impl NetworkFabric {
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self::with_runner(bridge_name, Box::new(SudoRunner))
    }

    pub fn with_runner(bridge_name: impl Into<String>, runner: Box<dyn PrivilegedRunner>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
            runner,
            creation_lock: Mutex::new(()),
        }
    }

    /// Verify the bridge exists and bring it up if it's down. Fails if the
    /// bridge is absent; provisioning it is the host operator's job.
    pub fn setup(&self) -> Result<(), TapError> {
        let output = Command::new("ip")
            .args(["link", "show", &self.bridge_name])
            .output()?;

        if !output.status.success() {
            return Err(TapError::BridgeMissing(self.bridge_name.clone()));
        }

        let info = String::from_utf8_lossy(&output.stdout);
        if info.contains("state DOWN") || info.contains(",DOWN") {
            info!(bridge = %self.bridge_name, "bridge is down, bringing it up");
            self.runner
                .run(&["link", "set", &self.bridge_name, "up"])?;
        }

        Ok(())
    }

    /// Create a tap device with the given name, enslave it to the bridge,
    /// bring it up, and set promiscuous mode. Deletes any pre-existing
    /// device of the same name first.
    pub fn create_tap(&self, name: &str) -> Result<(), TapError> {
        let _guard = self.creation_lock.lock().unwrap();
        self.create_tap_locked(name)
    }

    /// Same as `create_tap`, but picks the lowest unused `fc-tap-<N>` name.
    pub fn create_tap_auto(&self) -> Result<String, TapError> {
        let _guard = self.creation_lock.lock().unwrap();

        let existing = list_tap_names()?;
        for n in 0..MAX_AUTO_CANDIDATES.max(MIN_AUTO_CANDIDATES) {
            let candidate = format!("fc-tap-{n}");
            if existing.contains(&candidate) {
                continue;
            }
            // TOCTOU: another process may have claimed this name since the
            // listing above; double-check immediately before creating.
            if tap_exists(&candidate) {
                continue;
            }
            match self.create_tap_locked(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(TapError::CommandFailed(msg)) if msg.contains("Device or resource busy") => {
                    warn!(tap = %candidate, "name claimed by a racing process, rolling to next candidate");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(TapError::NamesExhausted(MAX_AUTO_CANDIDATES))
    }

    fn create_tap_locked(&self, name: &str) -> Result<(), TapError> {
        if tap_exists(name) {
            debug!(tap = %name, "tap already exists, deleting before recreate");
            self.delete_tap_locked(name)?;
            std::thread::sleep(Duration::from_millis(150));
        }

        let result = self.runner.run(&["tuntap", "add", "dev", name, "mode", "tap"]);
        let result = match result {
            Err(TapError::CommandFailed(msg)) if msg.contains("Device or resource busy") => {
                warn!(tap = %name, "tuntap add busy, retrying once after backoff");
                std::thread::sleep(Duration::from_millis(200));
                let _ = self.delete_tap_locked(name);
                std::thread::sleep(Duration::from_millis(150));
                self.runner.run(&["tuntap", "add", "dev", name, "mode", "tap"])
            }
            other => other,
        };
        result.map_err(|e| TapError::CreateFailed {
            name: name.to_string(),
            message: e.to_string(),
        })?;

        self.runner
            .run(&["link", "set", name, "master", &self.bridge_name])
            .map_err(|e| TapError::CreateFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        self.runner
            .run(&["link", "set", name, "up"])
            .map_err(|e| TapError::CreateFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        self.runner
            .run(&["link", "set", name, "promisc", "on"])
            .map_err(|e| TapError::CreateFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        info!(tap = %name, bridge = %self.bridge_name, "tap device created");
        Ok(())
    }

    /// Bring a tap device down and remove it. Errors indicating the device
    /// is already gone are absorbed.
    pub fn delete_tap(&self, name: &str) -> Result<(), TapError> {
        let _guard = self.creation_lock.lock().unwrap();
        self.delete_tap_locked(name)
    }

    fn delete_tap_locked(&self, name: &str) -> Result<(), TapError> {
        let _ = self.runner.run(&["link", "set", name, "down"]);

        match self.runner.run(&["link", "delete", name]) {
            Ok(()) => {
                debug!(tap = %name, "tap device deleted");
                Ok(())
            }
            Err(TapError::CommandFailed(msg))
                if msg.contains("Cannot find device") || msg.contains("does not exist") =>
            {
                Ok(())
            }
            Err(e) => Err(TapError::DeleteFailed {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// No-op: taps are per-VM and reclaimed by their owning handles.
    pub fn cleanup(&self) {}
}

fn tap_exists(name: &str) -> bool {
    std::path::Path::new(&format!("/sys/class/net/{name}")).exists()
}

/// List the names of every tap device currently visible to `ip`, whether
/// attached to a bridge yet or still a bare tuntap allocation.
fn list_tap_names() -> Result<Vec<String>, TapError> {
    let mut names = Vec::new();

    let link_output = Command::new("ip").args(["-o", "link", "show"]).output()?;
    if link_output.status.success() {
        let text = String::from_utf8_lossy(&link_output.stdout);
        for line in text.lines() {
            if let Some(name) = parse_link_line(line) {
                if name.starts_with("fc-tap-") {
                    names.push(name);
                }
            }
        }
    }

    let tuntap_output = Command::new("ip").args(["tuntap", "list"]).output()?;
    if tuntap_output.status.success() {
        let text = String::from_utf8_lossy(&tuntap_output.stdout);
        for line in text.lines() {
            if let Some(name) = parse_tuntap_line(line) {
                if name.starts_with("fc-tap-") && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }

    Ok(names)
}

/// Parse the device name out of an `ip -o link show` line, e.g.
/// `3: fc-tap-0: <BROADCAST,MULTICAST> mtu 1500 ...`.
fn parse_link_line(line: &str) -> Option<String> {
    let after_index = line.split_once(": ")?.1;
    let name = after_index.split_once(':')?.0;
    Some(name.trim().to_string())
}

/// Parse the device name out of an `ip tuntap list` line, e.g.
/// `fc-tap-0: tap`.
fn parse_tuntap_line(line: &str) -> Option<String> {
    let name = line.split_once(':')?.0;
    Some(name.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    struct RecordingRunner {
        calls: Arc<StdMutex<Vec<Vec<String>>>>,
        fail_once: Option<String>,
    }

    impl PrivilegedRunner for RecordingRunner {
        fn run(&self, args: &[&str]) -> Result<(), TapError> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            if let Some(ref fail_substr) = self.fail_once {
                if args.join(" ").contains(fail_substr.as_str()) {
                    return Err(TapError::CommandFailed("Device or resource busy".into()));
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_parse_link_line() {
        let line = "3: fc-tap-0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc pfifo_fast";
        assert_eq!(parse_link_line(line).as_deref(), Some("fc-tap-0"));
    }

    #[test]
    fn test_parse_tuntap_line() {
        let line = "fc-tap-3: tap persist user 0";
        assert_eq!(parse_tuntap_line(line).as_deref(), Some("fc-tap-3"));
    }

    #[test]
    fn test_create_tap_issues_expected_sequence() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let runner = RecordingRunner {
            calls: calls.clone(),
            fail_once: None,
        };
        let fabric = NetworkFabric::with_runner("fcbridge", Box::new(runner));

        fabric.create_tap("fc-tap-0").unwrap();

        let recorded = calls.lock().unwrap();
        assert_eq!(recorded[0][0..3], ["tuntap", "add", "dev"]);
        assert!(recorded.iter().any(|c| c.contains(&"master".to_string())));
        assert!(recorded.iter().any(|c| c.contains(&"promisc".to_string())));
    }

    #[test]
    fn test_min_auto_candidates_respects_contract() {
        assert!(MIN_AUTO_CANDIDATES >= 64);
    }
}

//! Device identity.
//!
//! The fingerprint is a SHA-256 over several OS and hardware signals, so it
//! survives an app reinstall. The device id is the host platform's
//! installation identifier and is passed in by the embedding app.
//!
//! Neither value is trusted by the server. The fingerprint is only a
//! correlation key for abuse scoring.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::env;
use vivid_types::DeviceInfo;

/// Environment variables set inside simulator/emulator sessions.
pub const SIMULATOR_ENV_VARS: &[&str] = &["SIMULATOR_DEVICE_NAME", "SIMULATOR_UDID"];

/// Raw signals the fingerprint is computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignals {
    pub os: String,
    pub os_version: String,
    pub arch: String,
    pub hostname: String,
    pub machine_id: Option<String>,
    pub user: Option<String>,
    pub model: String,
    /// A simulator environment variable was present.
    pub simulator_env: bool,
}

impl DeviceSignals {
    /// Collects signals from the running system.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            os: env::consts::OS.to_string(),
            os_version: get_os_version(),
            arch: env::consts::ARCH.to_string(),
            hostname: get_hostname(),
            machine_id: get_machine_id(),
            user: env::var("USER").or_else(|_| env::var("USERNAME")).ok(),
            model: get_model(),
            simulator_env: SIMULATOR_ENV_VARS.iter().any(|v| env::var_os(v).is_some()),
        }
    }

    /// SHA-256 over the stable signals, as 64 lowercase hex chars.
    ///
    /// The OS version is left out so a system update keeps the fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut components = vec![self.os.as_str(), self.arch.as_str(), self.hostname.as_str()];
        if let Some(machine_id) = &self.machine_id {
            components.push(machine_id);
        }
        if let Some(user) = &self.user {
            components.push(user);
        }
        components.push(&self.model);

        let mut hasher = Sha256::new();
        hasher.update(components.join("|").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// True if these signals look like a simulator or emulator.
    #[must_use]
    pub fn is_simulator(&self) -> bool {
        self.simulator_env || self.to_device_info("").indicates_simulator()
    }

    fn to_device_info(&self, app_version: &str) -> DeviceInfo {
        DeviceInfo {
            model: self.model.clone(),
            system_name: self.os.clone(),
            system_version: self.os_version.clone(),
            app_version: app_version.to_string(),
            is_simulator: self.simulator_env,
        }
    }
}

/// Identity reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub fingerprint: String,
    pub is_simulator: bool,
}

/// Supplies the device id, fingerprint and device info for requests.
#[derive(Debug, Clone)]
pub struct DeviceIdentityProvider {
    device_id: String,
    app_version: String,
    signals: DeviceSignals,
}

impl DeviceIdentityProvider {
    /// Builds a provider from the installation id and the running system.
    #[must_use]
    pub fn new(installation_id: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self::with_signals(installation_id, app_version, DeviceSignals::collect())
    }

    /// Builds a provider from explicit signals.
    #[must_use]
    pub fn with_signals(
        installation_id: impl Into<String>,
        app_version: impl Into<String>,
        signals: DeviceSignals,
    ) -> Self {
        Self {
            device_id: installation_id.into(),
            app_version: app_version.into(),
            signals,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> String {
        self.device_id.clone()
    }

    #[must_use]
    pub fn current_fingerprint(&self) -> String {
        self.signals.fingerprint()
    }

    #[must_use]
    pub fn is_simulator(&self) -> bool {
        self.signals.is_simulator()
    }

    #[must_use]
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            device_id: self.device_id(),
            fingerprint: self.current_fingerprint(),
            is_simulator: self.is_simulator(),
        }
    }

    /// Device description sent with trial and abuse requests.
    #[must_use]
    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            is_simulator: self.is_simulator(),
            ..self.signals.to_device_info(&self.app_version)
        }
    }
}

// ── System probes ────────────────────────────────────────────────

const UNKNOWN: &str = "unknown";

/// First non-empty trimmed line of a command's stdout.
#[cfg(target_os = "macos")]
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let out = std::process::Command::new(program).args(args).output().ok()?;
    String::from_utf8(out.stdout)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Trimmed contents of the first readable, non-empty file in `paths`.
#[cfg(target_os = "linux")]
fn first_file(paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| {
        std::fs::read_to_string(p)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn get_os_version() -> String {
    #[cfg(target_os = "macos")]
    let version = command_output("sw_vers", &["-productVersion"]);
    #[cfg(target_os = "linux")]
    let version = first_file(&["/etc/os-release"]).and_then(|release| {
        release
            .lines()
            .find_map(|l| l.strip_prefix("VERSION_ID="))
            .map(|v| v.trim_matches('"').to_string())
    });
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let version: Option<String> = None;

    version.unwrap_or_else(|| UNKNOWN.to_string())
}

fn get_machine_id() -> Option<String> {
    #[cfg(target_os = "macos")]
    return command_output("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).and_then(|out| {
        out.lines()
            .find(|l| l.contains("IOPlatformUUID"))
            .and_then(|l| l.rsplit('"').nth(1))
            .map(str::to_string)
    });
    #[cfg(target_os = "linux")]
    return first_file(&["/etc/machine-id", "/var/lib/dbus/machine-id"]);
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    return None;
}

fn get_model() -> String {
    #[cfg(target_os = "macos")]
    let model = command_output("sysctl", &["-n", "hw.model"]);
    #[cfg(target_os = "linux")]
    let model = first_file(&["/sys/devices/virtual/dmi/id/product_name"]);
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let model: Option<String> = None;

    model.unwrap_or_else(|| UNKNOWN.to_string())
}

//! Device description sent alongside trial and abuse requests.

use serde::{Deserialize, Serialize};

/// Model identifiers reported by iOS simulators in place of a hardware model.
const SIMULATOR_MODELS: &[&str] = &["i386", "x86_64", "arm64"];

/// Client-reported device details. Untrusted, like the fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Hardware model identifier (e.g. `iPhone15,2`).
    #[serde(default)]
    pub model: String,
    /// Operating system name.
    #[serde(default)]
    pub system_name: String,
    /// Operating system version.
    #[serde(default)]
    pub system_version: String,
    /// App version string.
    #[serde(default)]
    pub app_version: String,
    /// Set by the client when it detects it is running in a simulator.
    #[serde(default)]
    pub is_simulator: bool,
}

impl DeviceInfo {
    /// True when the flag is set or the model string gives the simulator away.
    #[must_use]
    pub fn indicates_simulator(&self) -> bool {
        if self.is_simulator {
            return true;
        }
        let model = self.model.to_ascii_lowercase();
        model.contains("simulator")
            || model.contains("emulator")
            || SIMULATOR_MODELS.contains(&model.as_str())
    }
}

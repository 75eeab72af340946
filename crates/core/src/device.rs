use crate::adb::{AdbClient, DeviceKind};
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The enumerable unit the CLI and the reassembly coordinator pass around:
/// a device serial, the transport it was discovered over, and its model
/// name if ADB reported one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub serial: String,
    pub kind: DeviceKind,
    pub model: String,
}

/// Enumerates and describes attached devices. Thin wrapper over `AdbClient`
/// with no state of its own.
pub struct DeviceManager {
    adb: AdbClient,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self { adb: AdbClient::new() }
    }

    /// Lists every attached device, whether in `device` state or not.
    pub fn list_targets(&self) -> Result<Vec<DeviceTarget>> {
        let devices = self.adb.devices()?;

        Ok(devices
            .into_iter()
            .map(|d| DeviceTarget {
                serial: d.id,
                kind: d.kind,
                model: d.model.unwrap_or_else(|| "unknown".to_string()),
            })
            .collect())
    }

    /// Lists only devices ADB reports as ready (`device` state).
    pub fn list_ready_targets(&self) -> Result<Vec<DeviceTarget>> {
        let devices = self.adb.devices()?;

        Ok(devices
            .into_iter()
            .filter(|d| d.state == "device")
            .map(|d| DeviceTarget {
                serial: d.id,
                kind: d.kind,
                model: d.model.unwrap_or_else(|| "unknown".to_string()),
            })
            .collect())
    }

    /// Resolves a single device: the named serial if given, otherwise the
    /// first device in `device` state.
    pub fn resolve(&self, serial: Option<String>) -> Result<String> {
        if let Some(serial) = serial {
            return Ok(serial);
        }

        let targets = self.list_ready_targets()?;
        targets
            .into_iter()
            .next()
            .map(|t| t.serial)
            .ok_or_else(|| TransferError::Transport("no ready devices attached".to_string()))
    }

    /// Collects `ro.product.*`/`ro.build.*` properties for a device.
    pub fn get_device_info(&self, serial: &str) -> Result<DeviceInfo> {
        debug!("collecting device info for {}", serial);

        let model = self.prop(serial, "ro.product.model");
        let brand = self.prop(serial, "ro.product.brand");
        let android_version = self.prop(serial, "ro.build.version.release");
        let sdk = self.prop(serial, "ro.build.version.sdk");
        let manufacturer = self.prop(serial, "ro.product.manufacturer");

        Ok(DeviceInfo {
            serial: serial.to_string(),
            model,
            brand,
            android_version,
            sdk,
            manufacturer,
        })
    }

    fn prop(&self, serial: &str, key: &str) -> String {
        self.adb
            .shell(serial, &format!("getprop {}", key))
            .map(|v| if v.is_empty() { "unknown".to_string() } else { v })
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    pub brand: String,
    pub android_version: String,
    pub sdk: String,
    pub manufacturer: String,
}

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::{debug, warn};

/// Kind of ADB connection a device was enumerated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Usb,
    Wifi,
}

/// One row of `adb devices -l`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbDevice {
    pub id: String,
    pub state: String,
    pub kind: DeviceKind,
    pub model: Option<String>,
}

/// Thin wrapper around the external `adb` binary. Every method blocks its
/// calling thread for the duration of the subprocess; there is no
/// application-level retry at this layer.
pub struct AdbClient;

impl AdbClient {
    pub fn new() -> Self {
        Self
    }

    fn command() -> Command {
        let mut cmd = Command::new("adb");
        suppress_window(&mut cmd);
        cmd
    }

    /// Runs `adb <args...>`, merging stderr into stdout and returning the
    /// output split into lines along with the process exit code.
    pub fn run(&self, args: &[&str]) -> Result<(Vec<String>, i32)> {
        debug!("adb {}", args.join(" "));

        let output = Self::command()
            .args(args)
            .output()
            .map_err(|e| TransferError::Transport(format!("failed to execute adb {}: {}", args.join(" "), e)))?;

        let code = output.status.code().unwrap_or(-1);
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect();
        lines.extend(String::from_utf8_lossy(&output.stderr).lines().map(|l| l.to_string()));

        if code != 0 {
            return Err(TransferError::Transport(format!(
                "adb {} exited with code {}: {}",
                args.join(" "),
                code,
                lines.join("\n")
            )));
        }

        Ok((lines, code))
    }

    /// Lists attached devices, classifying WiFi targets (id containing both
    /// `.` and `:`, i.e. an `ip:port` pair) versus USB-connected serials.
    pub fn devices(&self) -> Result<Vec<AdbDevice>> {
        let (lines, _) = self.run(&["devices", "-l"])?;
        let mut devices = Vec::new();

        for line in lines.iter().skip(1) {
            if line.trim().is_empty() {
                continue;
            }

            let mut parts = line.split_whitespace();
            let id = match parts.next() {
                Some(id) => id.to_string(),
                None => continue,
            };
            let state = match parts.next() {
                Some(s) => s.to_string(),
                None => continue,
            };

            let model = parts
                .find_map(|tok| tok.strip_prefix("model:"))
                .map(|m| m.to_string());

            let kind = if id.contains('.') && id.contains(':') {
                DeviceKind::Wifi
            } else {
                DeviceKind::Usb
            };

            devices.push(AdbDevice { id, state, kind, model });
        }

        debug!("found {} device(s)", devices.len());
        Ok(devices)
    }

    /// Runs a shell command on the device and returns trimmed stdout.
    pub fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let output = Self::command()
            .args(["-s", serial, "shell", command])
            .output()
            .map_err(|e| TransferError::Transport(format!("adb shell failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("shell command on {} failed: {}", serial, stderr);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Pushes a local file to a remote path on the device.
    pub fn push(&self, serial: &str, local_path: &str, remote_path: &str) -> Result<()> {
        let output = Self::command()
            .args(["-s", serial, "push", local_path, remote_path])
            .output()
            .map_err(|e| TransferError::Transport(format!("adb push failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransferError::Transport(format!("adb push failed: {}", stderr)));
        }

        Ok(())
    }

    /// Probes the size in bytes of a remote file via `stat -c%s`, returning
    /// `None` if the path does not exist.
    pub fn remote_size(&self, serial: &str, remote_path: &str) -> Result<Option<u64>> {
        let quoted = shell_quote(remote_path);
        let cmd = format!("stat -c%s {} 2>/dev/null", quoted);
        let out = self.shell(serial, &cmd)?;
        let trimmed = out.trim();

        if trimmed.is_empty() {
            return Ok(None);
        }

        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|_| TransferError::Protocol(format!("unexpected stat output: {:?}", trimmed)))
    }

    /// Connects to a device over WiFi. Returns `true` when the ADB output
    /// indicates an established or already-open connection.
    pub fn connect_wifi(&self, ip: &str, port: u16) -> Result<bool> {
        let target = format!("{}:{}", ip, port);
        let output = Self::command()
            .args(["connect", &target])
            .output()
            .map_err(|e| TransferError::Transport(format!("adb connect failed: {}", e)))?;

        let text = String::from_utf8_lossy(&output.stdout).to_lowercase();
        Ok(text.contains("connected to") || text.contains("already connected"))
    }

    /// Switches a USB-attached device into TCP/IP listening mode.
    pub fn enable_tcpip(&self, serial: &str, port: u16) -> Result<()> {
        let (_, code) = self.run(&["-s", serial, "tcpip", &port.to_string()])?;
        if code != 0 {
            return Err(TransferError::Transport(format!(
                "adb tcpip {} failed for {}",
                port, serial
            )));
        }
        Ok(())
    }

    /// Best-effort discovery of the device's WiFi IP address by reading
    /// `ip -4 addr show`, preferring `wlan*` interfaces over `eth*` over
    /// anything else, and excluding loopback.
    pub fn device_ip(&self, serial: &str) -> Result<Option<String>> {
        let output = self.shell(serial, "ip -4 addr show")?;
        let mut candidates: Vec<(String, String)> = Vec::new();
        let mut current_iface = String::new();

        for line in output.lines() {
            let trimmed = line.trim();
            if !trimmed.starts_with("inet ") {
                if let Some(colon) = trimmed.find(':') {
                    if !trimmed.starts_with("inet") {
                        let rest = &trimmed[colon + 1..];
                        if let Some(name) = rest.split_whitespace().next() {
                            current_iface = name.trim_end_matches(':').to_string();
                        }
                    }
                }
                continue;
            }

            if let Some(addr_part) = trimmed.strip_prefix("inet ") {
                if let Some(ip) = addr_part.split('/').next() {
                    if ip != "127.0.0.1" {
                        candidates.push((current_iface.clone(), ip.to_string()));
                    }
                }
            }
        }

        let priority = |iface: &str| -> u8 {
            if iface.starts_with("wlan") {
                0
            } else if iface.starts_with("eth") {
                1
            } else {
                2
            }
        };

        candidates.sort_by_key(|(iface, _)| priority(iface));
        Ok(candidates.into_iter().next().map(|(_, ip)| ip))
    }
}

impl Default for AdbClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Quotes a path for embedding in a POSIX `sh` command run through
/// `adb shell`, wrapping in single quotes and escaping any embedded ones.
pub fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

#[cfg(windows)]
fn suppress_window(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn suppress_window(_cmd: &mut Command) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("/sdcard/foo"), "'/sdcard/foo'");
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        assert_eq!(shell_quote("/sdcard/it's"), "'/sdcard/it'\\''s'");
    }

    #[test]
    fn test_shell_quote_whitespace() {
        assert_eq!(shell_quote("/sdcard/My Files"), "'/sdcard/My Files'");
    }
}

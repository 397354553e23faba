//! Host identity used for lock records and the machine-derived key.

use crate::paths;
#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "macos")]
use std::process::Command;

/// Kernel hostname. Environment variables are ignored so the machine key
/// does not depend on how the process was launched.
pub fn hostname() -> String {
    ::hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

pub fn cpu_model() -> String {
    #[cfg(target_os = "linux")]
    {
        if let Ok(info) = fs::read_to_string("/proc/cpuinfo") {
            let model = info
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(key, _)| {
                    let key = key.trim();
                    key == "model name" || key == "Hardware" || key == "cpu model"
                })
                .map(|(_, value)| value.trim().to_string());
            if let Some(model) = model {
                return model;
            }
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Some(model) = Command::new("sysctl")
            .args(["-n", "machdep.cpu.brand_string"])
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
            .filter(|model| !model.is_empty())
        {
            return model;
        }
    }
    #[cfg(windows)]
    {
        if let Ok(model) = std::env::var("PROCESSOR_IDENTIFIER") {
            return model;
        }
    }
    "unknown-cpu".to_string()
}

/// Concatenation of host attributes fed into the machine-derived key.
/// Stable for a given user on a given host; not secret.
pub fn fingerprint() -> String {
    let home = paths::home_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!(
        "{}{}{}{}{}",
        hostname(),
        std::env::consts::OS,
        std::env::consts::ARCH,
        cpu_model(),
        home
    )
}

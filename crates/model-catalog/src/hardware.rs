use std::{
    fs,
    path::PathBuf,
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;

const CACHE_TTL_SECS: u64 = 3600;
const CACHE_FILE_NAME: &str = "capabilities.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuInfo {
    pub vendor: String,
    pub vram_mib: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapabilities {
    pub cpu_cores: usize,
    pub cpu_arch: String,
    pub ram_mib: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuInfo>,
}

impl HostCapabilities {
    pub fn gpu_vram_mib(&self) -> u64 {
        self.gpu.as_ref().map(|gpu| gpu.vram_mib).unwrap_or(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedCapabilities {
    detected_at_unix: u64,
    capabilities: HostCapabilities,
}

/// Detect host capabilities, serving a cached result while it is fresh.
pub fn detect_capabilities() -> Result<HostCapabilities> {
    if let Some(cached) = read_fresh_cache() {
        return Ok(cached);
    }

    let capabilities = probe_host();
    if let Err(error) = write_cache(&capabilities) {
        tracing::debug!(%error, "failed to cache host capabilities");
    }

    Ok(capabilities)
}

/// Probe the host directly, bypassing the cache.
pub fn probe_host() -> HostCapabilities {
    let mut system = System::new_all();
    system.refresh_memory();

    HostCapabilities {
        cpu_cores: system.cpus().len().max(1),
        cpu_arch: std::env::consts::ARCH.to_string(),
        ram_mib: system.total_memory() / (1024 * 1024),
        gpu: detect_gpu(&system),
    }
}

fn detect_gpu(system: &System) -> Option<GpuInfo> {
    if cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64" {
        // Apple Silicon shares system memory with the GPU.
        return Some(GpuInfo {
            vendor: "apple".to_string(),
            vram_mib: system.total_memory() / (1024 * 1024),
        });
    }

    detect_nvidia_gpu()
}

fn detect_nvidia_gpu() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let vram_mib = stdout.lines().next()?.trim().parse::<u64>().ok()?;

    Some(GpuInfo {
        vendor: "nvidia".to_string(),
        vram_mib,
    })
}

fn cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("folder-mcp").join(CACHE_FILE_NAME))
}

fn read_fresh_cache() -> Option<HostCapabilities> {
    let path = cache_path()?;
    let raw = fs::read_to_string(path).ok()?;
    let cached: CachedCapabilities = serde_json::from_str(&raw).ok()?;

    let now = unix_now();
    if now.saturating_sub(cached.detected_at_unix) >= CACHE_TTL_SECS {
        return None;
    }

    Some(cached.capabilities)
}

fn write_cache(capabilities: &HostCapabilities) -> Result<()> {
    let path = cache_path().context("no cache directory available")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
    }

    let payload = serde_json::to_string_pretty(&CachedCapabilities {
        detected_at_unix: unix_now(),
        capabilities: capabilities.clone(),
    })
    .context("Failed to serialize host capabilities")?;

    fs::write(&path, payload)
        .with_context(|| format!("Failed to write capabilities cache {}", path.display()))?;
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

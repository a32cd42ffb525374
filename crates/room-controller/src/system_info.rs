//! Host and process resource usage for `GET /admin/v1/stats`.
//!
//! Per-worker figures come from the media pool. This covers the machine and
//! the controller process itself, so a hot worker can be told apart from a
//! hot host.

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub cpu_count: usize,
    /// Averaged across cores, 0-100. Reads 0 on a cold sample.
    pub cpu_percent: u32,
    pub memory_percent: u32,
    /// One-minute load average. Zero where the platform has none.
    pub load_average: f64,
    /// Resident memory of the controller process, in bytes.
    pub process_memory_bytes: u64,
}

/// Take one sample. Blocking; call from `spawn_blocking`.
#[must_use]
pub fn gather_system_info() -> SystemInfo {
    let mut sys = System::new_all();
    sys.refresh_all();

    let process_memory_bytes = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .map_or(0, sysinfo::Process::memory);

    SystemInfo {
        cpu_count: sys.cpus().len(),
        cpu_percent: clamp_percent(f64::from(sys.global_cpu_info().cpu_usage())),
        memory_percent: percent_of(sys.used_memory(), sys.total_memory()),
        load_average: System::load_average().one,
        process_memory_bytes,
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent_of(used: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    clamp_percent(used as f64 / total as f64 * 100.0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_percent(value: f64) -> u32 {
    value.clamp(0.0, 100.0) as u32
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_is_in_range() {
        let info = gather_system_info();
        assert!(info.cpu_count >= 1);
        assert!(info.cpu_percent <= 100);
        assert!(info.memory_percent <= 100);
        assert!(info.load_average >= 0.0);
    }

    #[test]
    fn test_percent_helpers() {
        assert_eq!(percent_of(1, 4), 25);
        assert_eq!(percent_of(5, 0), 0);
        assert_eq!(clamp_percent(130.0), 100);
        assert_eq!(clamp_percent(-3.0), 0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let info = SystemInfo {
            cpu_count: 8,
            cpu_percent: 12,
            memory_percent: 40,
            load_average: 0.5,
            process_memory_bytes: 1024,
        };
        let json = serde_json::to_value(info).unwrap();
        assert_eq!(json["cpuCount"], 8);
        assert_eq!(json["loadAverage"], 0.5);
        assert_eq!(json["processMemoryBytes"], 1024);
    }
}

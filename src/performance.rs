use std::fs;

use tracing::{info, warn};

use crate::config::PipelineArgs;
use crate::domain::ConfigValue;
use crate::error::GearError;

/// CPU count arguments: (key, set even when missing from the config).
const CPU_KEYS: [(&str, bool); 3] = [("n_cpus", true), ("omp-nthreads", false), ("n_procs", false)];

/// Memory arguments: (key, unit, set even when missing from the config).
const MEMORY_KEYS: [(&str, MemoryUnit, bool); 2] = [
    ("mem_mb", MemoryUnit::MiB, true),
    ("mem_gb", MemoryUnit::GiB, false),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUnit {
    MiB,
    GiB,
}

impl MemoryUnit {
    fn bytes(&self) -> u64 {
        match self {
            MemoryUnit::MiB => 1024 * 1024,
            MemoryUnit::GiB => 1024 * 1024 * 1024,
        }
    }
}

pub trait HostResources {
    fn cpu_count(&self) -> Result<u64, GearError>;
    fn available_memory_bytes(&self) -> Result<u64, GearError>;
}

impl<H: HostResources + ?Sized> HostResources for &H {
    fn cpu_count(&self) -> Result<u64, GearError> {
        (**self).cpu_count()
    }

    fn available_memory_bytes(&self) -> Result<u64, GearError> {
        (**self).available_memory_bytes()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostResources for SystemHost {
    fn cpu_count(&self) -> Result<u64, GearError> {
        std::thread::available_parallelism()
            .map(|count| count.get() as u64)
            .map_err(|err| GearError::HostIntrospection(err.to_string()))
    }

    fn available_memory_bytes(&self) -> Result<u64, GearError> {
        let meminfo = fs::read_to_string("/proc/meminfo")
            .map_err(|err| GearError::HostIntrospection(format!("/proc/meminfo: {err}")))?;
        parse_meminfo_available(&meminfo).ok_or_else(|| {
            GearError::HostIntrospection("MemAvailable missing from /proc/meminfo".to_string())
        })
    }
}

pub fn parse_meminfo_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

pub struct PerformanceResolver<H: HostResources> {
    host: H,
}

impl<H: HostResources> PerformanceResolver<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn resolve_cpus(&self, name: &str, requested: Option<u64>) -> u64 {
        let max = match self.host.cpu_count() {
            Ok(count) => count,
            Err(err) => {
                warn!("{err}, assuming a single cpu");
                1
            }
        };
        info!("host cpu count = {max}");
        match requested {
            Some(value) if value > 0 => {
                if value > max {
                    warn!("{name} > number available, using max {max}");
                    max
                } else {
                    info!("{name} using {value} from config");
                    value
                }
            }
            _ => {
                info!("using {name} = {max} (maximum available)");
                max
            }
        }
    }

    pub fn resolve_memory(&self, name: &str, requested: Option<f64>, unit: MemoryUnit) -> Option<f64> {
        let requested = requested.filter(|value| *value > 0.0);
        let max = match self.host.available_memory_bytes() {
            Ok(bytes) => (bytes / unit.bytes()) as f64,
            Err(err) => {
                warn!("{err}, cannot check {name} against available memory");
                return requested;
            }
        };
        info!("available memory = {max} ({unit:?})");
        match requested {
            Some(value) if value > max => {
                warn!("{name} > number available, using max {max}");
                Some(max)
            }
            Some(value) => {
                info!("{name} using {value} from config");
                Some(value)
            }
            None => {
                info!("using {name} = {max} (maximum available)");
                Some(max)
            }
        }
    }

    /// Returns a copy of `args` with CPU and memory settings resolved.
    /// `n_cpus` and `mem_mb` are always present afterwards; the other known
    /// keys are only touched when the config has them.
    pub fn apply(&self, args: &PipelineArgs) -> PipelineArgs {
        let mut resolved = args.clone();

        for (key, always) in CPU_KEYS {
            let current = args.get(key);
            if current.is_none() && !always {
                continue;
            }
            let requested = current.and_then(ConfigValue::as_f64).map(|value| value as u64);
            let value = self.resolve_cpus(key, requested);
            resolved.insert(key.to_string(), ConfigValue::from(value));
        }

        for (key, unit, always) in MEMORY_KEYS {
            let current = args.get(key);
            if current.is_none() && !always {
                continue;
            }
            let requested = current.and_then(ConfigValue::as_f64);
            if let Some(value) = self.resolve_memory(key, requested, unit) {
                resolved.insert(key.to_string(), memory_value(value));
            }
        }

        resolved
    }
}

fn memory_value(value: f64) -> ConfigValue {
    if value.fract() == 0.0 && value >= 0.0 {
        return ConfigValue::from(value as u64);
    }
    serde_json::Number::from_f64(value)
        .map(ConfigValue::Number)
        .unwrap_or_else(|| ConfigValue::Text(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_available_in_bytes() {
        let meminfo = "MemTotal:       16318412 kB\nMemFree:         1022000 kB\nMemAvailable:    8159206 kB\n";
        assert_eq!(parse_meminfo_available(meminfo), Some(8159206 * 1024));
        assert_eq!(parse_meminfo_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn fractional_memory_stays_fractional() {
        assert_eq!(memory_value(12.0).to_string(), "12");
        assert_eq!(memory_value(12.5).to_string(), "12.5");
    }
}

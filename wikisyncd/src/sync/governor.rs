use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, System};

use crate::sync::transfer::TransferGuard;

/// Reads the host figures the governor compares against its thresholds.
pub trait ResourceProbe: Send + Sync {
    fn free_disk_bytes(&self, path: &Path) -> io::Result<u64>;
    fn available_memory_bytes(&self) -> u64;
    fn cpu_percent(&self) -> f32;
}

pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

/// Global CPU usage over the next `window`. Blocks the calling thread for `window`.
fn sample_cpu_usage(system: &mut System, window: Duration) -> f32 {
    system.refresh_cpu_usage();
    std::thread::sleep(window.max(MINIMUM_CPU_UPDATE_INTERVAL));
    system.refresh_cpu_usage();
    system.global_cpu_usage()
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn free_disk_bytes(&self, path: &Path) -> io::Result<u64> {
        fs4::available_space(path)
    }

    fn available_memory_bytes(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            Err(_) => u64::MAX,
        }
    }

    fn cpu_percent(&self) -> f32 {
        match self.system.lock() {
            Ok(mut system) => sample_cpu_usage(&mut system, MINIMUM_CPU_UPDATE_INTERVAL),
            Err(_) => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub min_free_disk_bytes: u64,
    pub min_available_memory_bytes: u64,
    pub max_cpu_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub free_disk_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shortage {
    Disk { available: u64, required: u64 },
    Memory { available: u64, required: u64 },
    Cpu { usage: f32, limit: f32 },
}

impl fmt::Display for Shortage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortage::Disk {
                available,
                required,
            } => write!(f, "free disk {available} bytes below {required} bytes"),
            Shortage::Memory {
                available,
                required,
            } => write!(f, "available memory {available} bytes below {required} bytes"),
            Shortage::Cpu { usage, limit } => {
                write!(f, "cpu usage {usage:.1}% above {limit:.1}%")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub snapshot: ResourceSnapshot,
    pub shortages: Vec<Shortage>,
}

impl GateDecision {
    pub fn is_clear(&self) -> bool {
        self.shortages.is_empty()
    }

    pub fn describe(&self) -> String {
        self.shortages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Clone)]
pub struct ResourceGovernor {
    probe: Arc<dyn ResourceProbe>,
    thresholds: ResourceThresholds,
    data_root: PathBuf,
}

impl ResourceGovernor {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        thresholds: ResourceThresholds,
        data_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            probe,
            thresholds,
            data_root: data_root.into(),
        }
    }

    pub fn snapshot(&self) -> io::Result<ResourceSnapshot> {
        Ok(ResourceSnapshot {
            free_disk_bytes: self.probe.free_disk_bytes(&self.data_root)?,
            available_memory_bytes: self.probe.available_memory_bytes(),
            cpu_percent: self.probe.cpu_percent(),
        })
    }

    pub fn check(&self) -> io::Result<GateDecision> {
        let snapshot = self.snapshot()?;
        let mut shortages = Vec::new();
        if snapshot.free_disk_bytes < self.thresholds.min_free_disk_bytes {
            shortages.push(Shortage::Disk {
                available: snapshot.free_disk_bytes,
                required: self.thresholds.min_free_disk_bytes,
            });
        }
        if snapshot.available_memory_bytes < self.thresholds.min_available_memory_bytes {
            shortages.push(Shortage::Memory {
                available: snapshot.available_memory_bytes,
                required: self.thresholds.min_available_memory_bytes,
            });
        }
        if snapshot.cpu_percent > self.thresholds.max_cpu_percent {
            shortages.push(Shortage::Cpu {
                usage: snapshot.cpu_percent,
                limit: self.thresholds.max_cpu_percent,
            });
        }
        Ok(GateDecision {
            snapshot,
            shortages,
        })
    }

    /// Disk-only check used while bytes are being written.
    pub fn check_disk(&self) -> Result<(), Shortage> {
        let available = self
            .probe
            .free_disk_bytes(&self.data_root)
            .unwrap_or(0);
        if available < self.thresholds.min_free_disk_bytes {
            return Err(Shortage::Disk {
                available,
                required: self.thresholds.min_free_disk_bytes,
            });
        }
        Ok(())
    }
}

impl TransferGuard for ResourceGovernor {
    fn check(&self) -> Result<(), String> {
        self.check_disk().map_err(|shortage| shortage.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedProbe {
        disk: AtomicU64,
        memory: u64,
        cpu: f32,
    }

    impl ResourceProbe for FixedProbe {
        fn free_disk_bytes(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.disk.load(Ordering::SeqCst))
        }

        fn available_memory_bytes(&self) -> u64 {
            self.memory
        }

        fn cpu_percent(&self) -> f32 {
            self.cpu
        }
    }

    fn thresholds() -> ResourceThresholds {
        ResourceThresholds {
            min_free_disk_bytes: 1_000,
            min_available_memory_bytes: 500,
            max_cpu_percent: 80.0,
        }
    }

    #[test]
    fn clear_when_every_figure_is_within_limits() {
        let probe = Arc::new(FixedProbe {
            disk: AtomicU64::new(5_000),
            memory: 1_000,
            cpu: 10.0,
        });
        let governor = ResourceGovernor::new(probe, thresholds(), "/data");
        let decision = governor.check().unwrap();
        assert!(decision.is_clear());
        assert_eq!(decision.snapshot.free_disk_bytes, 5_000);
    }

    #[test]
    fn reports_every_shortage() {
        let probe = Arc::new(FixedProbe {
            disk: AtomicU64::new(10),
            memory: 10,
            cpu: 95.0,
        });
        let governor = ResourceGovernor::new(probe, thresholds(), "/data");
        let decision = governor.check().unwrap();
        assert_eq!(decision.shortages.len(), 3);
        assert!(decision.describe().contains("free disk 10 bytes"));
    }

    #[test]
    fn transfer_guard_tracks_disk_only() {
        let probe = Arc::new(FixedProbe {
            disk: AtomicU64::new(5_000),
            memory: 0,
            cpu: 100.0,
        });
        let governor = ResourceGovernor::new(probe.clone(), thresholds(), "/data");
        assert!(TransferGuard::check(&governor).is_ok());

        probe.disk.store(999, Ordering::SeqCst);
        let err = TransferGuard::check(&governor).unwrap_err();
        assert!(err.contains("free disk 999 bytes"));
    }

    #[test]
    fn cpu_sample_covers_a_fresh_window() {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let spinner = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };

        let mut system = System::new();
        let started = std::time::Instant::now();
        let usage = sample_cpu_usage(&mut system, Duration::ZERO);
        stop.store(true, Ordering::Relaxed);
        spinner.join().unwrap();

        assert!(started.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL);
        assert!(usage > 0.0, "busy thread not visible: {usage}");
        assert!(usage <= 100.0);
    }
}

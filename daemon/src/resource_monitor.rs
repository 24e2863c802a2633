use std::collections::HashSet;
use sysinfo::{Disks, System};
use tracing::info;

use crate::global_manager::GlobalSettings;

const MIB: u64 = 1024 * 1024;

/// Free space in bytes per mount point, as seen on one check.
#[derive(Debug, Clone, Default)]
pub struct ResourceSample {
    pub free_memory: Option<u64>,
    pub disks: Vec<(String, u64)>,
}

impl ResourceSample {
    pub fn collect(sys: &mut System) -> Self {
        sys.refresh_memory();
        let disks = Disks::new_with_refreshed_list()
            .iter()
            .map(|d| (d.mount_point().to_string_lossy().into_owned(), d.available_space()))
            .collect();
        Self {
            free_memory: Some(sys.available_memory()),
            disks,
        }
    }
}

/// Raises one alert per low-resource episode and re-arms once the resource
/// recovers above 90% of the threshold.
#[derive(Default)]
pub struct ResourceMonitor {
    memory_alerted: bool,
    disks_alerted: HashSet<String>,
}

fn rearm_level(min_mib: i64) -> u64 {
    (min_mib.max(0) as u64) * MIB * 9 / 10
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the alerts to raise for this sample.
    pub fn check(&mut self, settings: &GlobalSettings, sample: &ResourceSample) -> Vec<String> {
        let mut alerts = Vec::new();

        if settings.alert_memory && settings.min_memory > 0 {
            if let Some(free) = sample.free_memory {
                let min = settings.min_memory as u64 * MIB;
                if !self.memory_alerted {
                    if free < min {
                        alerts.push(format!("LOW MEMORY: Current {free} less than minimum {min}"));
                        self.memory_alerted = true;
                    }
                } else if free > rearm_level(settings.min_memory) {
                    info!("Memory now at {free}, resetting monitoring");
                    self.memory_alerted = false;
                }
            }
        }

        if settings.alert_disk && settings.min_disk > 0 {
            let min = settings.min_disk as u64 * MIB;
            for (mount, free) in &sample.disks {
                if !settings.alert_disk_list.contains(mount) {
                    continue;
                }
                if !self.disks_alerted.contains(mount) {
                    if *free < min {
                        alerts.push(format!("LOW DISK: {mount} Current {free} less than minimum {min}"));
                        self.disks_alerted.insert(mount.clone());
                    }
                } else if *free > rearm_level(settings.min_disk) {
                    info!("Disk {mount} now at {free}, resetting monitoring");
                    self.disks_alerted.remove(mount);
                }
            }
        }

        alerts
    }
}

//! Memory map of the target process, as reported by the OS.
//!
//! A convenience surface for the façade: stack and heap discovery, and
//! the "where is this address mapped" question during memory errors.

use std::fmt::{self, Display};

use serde::Serialize;

use crate::addr::Addr;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryRegion {
    pub start: Addr,
    pub end: Addr,
    pub size: usize,
    pub permissions: MemoryPermissions,
    pub offset: usize,
    pub path: Option<String>,
}

impl MemoryRegion {
    pub fn contains(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub shared: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMemoryMap {
    pub regions: Vec<MemoryRegion>,
    pub total_mapped: usize,
}

impl ProcessMemoryMap {
    pub fn region_of(&self, addr: Addr) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    pub fn executable_regions(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter().filter(|r| r.permissions.execute)
    }
}

impl From<Vec<proc_maps::MapRange>> for ProcessMemoryMap {
    fn from(ranges: Vec<proc_maps::MapRange>) -> Self {
        let regions: Vec<MemoryRegion> = ranges
            .iter()
            .map(|range| {
                let start = range.start();
                let size = range.size();
                // the 4th flag character distinguishes shared mappings
                let shared = range.flags.len() >= 4 && &range.flags[3..4] == "s";
                MemoryRegion {
                    start: Addr::from(start),
                    end: Addr::from(start + size),
                    size,
                    permissions: MemoryPermissions {
                        read: range.is_read(),
                        write: range.is_write(),
                        execute: range.is_exec(),
                        shared,
                    },
                    offset: range.offset,
                    path: range.filename().map(|p| p.to_string_lossy().to_string()),
                }
            })
            .collect();

        let total_mapped = regions.iter().map(|r| r.size).sum();
        ProcessMemoryMap {
            regions,
            total_mapped,
        }
    }
}

impl Display for ProcessMemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} regions, {} bytes mapped",
            self.regions.len(),
            self.total_mapped
        )?;
        for region in &self.regions {
            let perms = format!(
                "{}{}{}{}",
                if region.permissions.read { "r" } else { "-" },
                if region.permissions.write { "w" } else { "-" },
                if region.permissions.execute { "x" } else { "-" },
                if region.permissions.shared { "s" } else { "p" },
            );
            writeln!(
                f,
                "{:016x}-{:016x} {} ({} bytes) {}",
                region.start.usize(),
                region.end.usize(),
                perms,
                region.size,
                region.path.as_deref().unwrap_or("[anonymous]")
            )?;
        }
        Ok(())
    }
}

//! Host-level services used by the controller: the periodic system report
//! and the reboot command.

use anyhow::{Context, Result};
use std::process::Command;
use sysinfo::System;

const KIB: u64 = 1024;

/// Flat snapshot of host health, rendered into the operational log.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub uptime_secs: u64,
    /// 1, 5 and 15 minute load averages.
    pub load: [f64; 3],
    pub total_memory: u64,
    pub free_memory: u64,
    pub available_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub free_swap: u64,
    pub processes: usize,
}

impl SystemSnapshot {
    /// Multi-line report for the operational log.  Memory is in KiB.
    pub fn report(&self) -> String {
        let up = self.uptime_secs;
        format!(
            "System info:\n\
             Uptime: {}d {}h {}m {}s\n\
             Load Avgs: {:.2}:1m {:.2}:5m {:.2}:15m\n\
             RAM (KiB): {}:tot {}:fr {}:avail {}:used\n\
             Swap (KiB): {}:tot {}:fr\n\
             Processes: {}",
            up / 86_400,
            up % 86_400 / 3_600,
            up % 3_600 / 60,
            up % 60,
            self.load[0],
            self.load[1],
            self.load[2],
            self.total_memory / KIB,
            self.free_memory / KIB,
            self.available_memory / KIB,
            self.used_memory / KIB,
            self.total_swap / KIB,
            self.free_swap / KIB,
            self.processes,
        )
    }
}

pub trait Host: Send {
    /// `None` when the platform cannot report system information.
    fn system_info(&mut self) -> Option<SystemSnapshot>;

    /// Run the reboot command; returns its exit code (-1 if killed by a
    /// signal).
    fn reboot(&mut self) -> Result<i32>;
}

/// The real host: `sysinfo` for the report, a configured argv for reboot.
pub struct SysHost {
    reboot_command: Vec<String>,
}

impl SysHost {
    pub fn new(reboot_command: Vec<String>) -> Self {
        Self { reboot_command }
    }
}

impl Host for SysHost {
    fn system_info(&mut self) -> Option<SystemSnapshot> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return None;
        }
        let sys = System::new_all();
        let load = System::load_average();
        Some(SystemSnapshot {
            uptime_secs: System::uptime(),
            load: [load.one, load.five, load.fifteen],
            total_memory: sys.total_memory(),
            free_memory: sys.free_memory(),
            available_memory: sys.available_memory(),
            used_memory: sys.used_memory(),
            total_swap: sys.total_swap(),
            free_swap: sys.free_swap(),
            processes: sys.processes().len(),
        })
    }

    fn reboot(&mut self) -> Result<i32> {
        let Some((program, args)) = self.reboot_command.split_first() else {
            anyhow::bail!("reboot command is empty");
        };
        tracing::warn!(command = ?self.reboot_command, "running reboot command");
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("failed to run {program}"))?;
        Ok(status.code().unwrap_or(-1))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

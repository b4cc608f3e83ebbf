//! Utilities for controlling and inspecting the state of the current process.

use std::os::fd::AsRawFd;

use crate::error::{ CampaignError, Result };

pub struct FrontalEnv;
impl FrontalEnv {
    const ISOLATED_PATH: &'static str =
        "/sys/devices/system/cpu/isolated";
    const NOHZ_PATH: &'static str =
        "/sys/devices/system/cpu/nohz_full";

    fn read_cpu_list(path: &str) -> Result<String> {
        let res = std::fs::read_to_string(path)?;
        Ok(match res.trim() {
            "" => "disabled".to_string(),
            s => s.to_string(),
        })
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> Result<String> {
        Self::read_cpu_list(Self::ISOLATED_PATH)
    }

    /// Return a string describing the set of 'nohz_full' cores.
    pub fn sysfs_nohz() -> Result<String> {
        Self::read_cpu_list(Self::NOHZ_PATH)
    }

    /// Pin to a particular core.
    pub fn pin_to_core(core: usize) -> Result<()> {
        let this_pid = nix::unistd::Pid::from_raw(0);
        let mut cpuset = nix::sched::CpuSet::new();
        cpuset.set(core).map_err(|_| {
            CampaignError::Config(format!("no such CPU core {}", core))
        })?;
        nix::sched::sched_setaffinity(this_pid, &cpuset)
            .map_err(std::io::Error::from)?;
        log::debug!("pinned to core {}", core);
        Ok(())
    }

    /// Returns true if stdout is attached to a terminal.
    pub fn stdout_is_tty() -> bool {
        nix::unistd::isatty(std::io::stdout().as_raw_fd()).unwrap_or(false)
    }

    /// Log the parts of the environment which tend to add noise to
    /// single-stepping measurements.
    pub fn log_summary() {
        if Self::stdout_is_tty() {
            log::warn!("stdout is a terminal; consider redirecting output \
                to a file to reduce noise");
        }
        match Self::sysfs_isolated() {
            Ok(s) => log::info!("isolated cores: {}", s),
            Err(e) => log::debug!("couldn't read isolated cores: {}", e),
        }
        match Self::sysfs_nohz() {
            Ok(s) => log::info!("nohz_full cores: {}", s),
            Err(e) => log::debug!("couldn't read nohz_full cores: {}", e),
        }
    }
}

use linux_loader::cmdline::Cmdline;
use std::convert::{TryFrom, TryInto};
use std::path::PathBuf;

mod builder;

const KERNEL_CMDLINE_CAPACITY: usize = 4096;
// Default command line
const KERNEL_CMDLINE_DEFAULT: &str = "console=ttyS0 i8042.nokbd reboot=k panic=1 pci=off";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kernel configuration file check error")]
    KernelConfig(String),
    #[error("Unknown scheduler policy {0:?}, expected \"bvt\" or \"iorr\"")]
    UnknownScheduler(String),
}

/// Which [`vmm::sched`](crate::sched) policy backs every pCPU's run queue.
/// Defaults to I/O-RR, matching the original's `CONFIG_SCHED_IORR` default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerChoice {
    Bvt,
    Iorr,
}

impl Default for SchedulerChoice {
    fn default() -> Self {
        SchedulerChoice::Iorr
    }
}

impl TryFrom<&str> for SchedulerChoice {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "bvt" => Ok(SchedulerChoice::Bvt),
            "iorr" => Ok(SchedulerChoice::Iorr),
            other => Err(Error::UnknownScheduler(other.to_string())),
        }
    }
}

/// VMM configuration.
#[derive(Debug)]
pub struct VMMConfig {
    /// Linux kernel path
    pub kernel: KernelConfig,

    /// Number of virtual CPUs assigned to the guest
    pub cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    pub memory: u32,

    /// A level of verbosity, and can be used multiple times
    pub verbose: i32,

    /// Stdout console file path
    pub console: Option<String>,

    /// Scheduler policy backing every pCPU's run queue (spec.md §4.2).
    pub scheduler: SchedulerChoice,

    /// Anti-storm delay applied to passthrough interrupts for this (non
    /// Service-VM) guest, in milliseconds; `0` disables the delay
    /// (spec.md §4.6).
    pub ptirq_delay_ms: u64,
}

impl Default for VMMConfig {
    fn default() -> Self {
        VMMConfig {
            kernel: KernelConfig::default(),
            cpus: 1,
            memory: 512,
            verbose: 0,
            console: None,
            scheduler: SchedulerChoice::default(),
            ptirq_delay_ms: 0,
        }
    }
}

/// Store the current state of the kernel & its command line
/// arguments
#[derive(Clone, Debug, PartialEq)]
pub struct KernelConfig {
    /// Path to the kernel binary
    pub kernel_path: PathBuf,

    /// Command line arguments for kernel binary run
    pub cmdline: Cmdline,
}

impl TryFrom<String> for KernelConfig {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let path = PathBuf::from(value);
        let kernel = KernelConfig {
            kernel_path: path.clone(),
            ..Default::default()
        };

        if !path.exists() {
            return Err(Error::KernelConfig("File does not exist".to_string()));
        }

        Ok(kernel)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            kernel_path: PathBuf::default(),
            // We define the highest capacity of CMD line so we don't have overflow problems
            cmdline: KernelConfig::default_cmdline(),
        }
    }
}

impl KernelConfig {
    pub fn new(path: String, cfg_cmdline: Option<String>) -> Result<Self, Error> {
        let mut cmdline = Cmdline::new(KERNEL_CMDLINE_CAPACITY);
        cmdline
            .insert_str(cfg_cmdline.unwrap_or(KERNEL_CMDLINE_DEFAULT.to_string()))
            .map_err(|_| Error::KernelConfig("Capacity error on kernel cmdline".to_string()))?;

        let mut kernel: KernelConfig = path.try_into()?;
        kernel.cmdline = cmdline;

        Ok(kernel)
    }

    pub fn default_cmdline() -> Cmdline {
        let mut cmd = Cmdline::new(KERNEL_CMDLINE_CAPACITY);

        // Safe `unwrap` as sufficient capacity
        cmd.insert_str(KERNEL_CMDLINE_DEFAULT).unwrap();
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use std::convert::TryInto;

    #[test]
    fn test_success_try_from_kernelconfig() {
        let valid_path = String::from("./Cargo.toml");
        let kernel: Result<KernelConfig, crate::config::Error> = valid_path.try_into();
        assert!(kernel.is_ok())
    }

    #[test]
    fn test_sucess_new_kernelconfig() {
        let valid_path = String::from("./Cargo.toml");
        let kernel = KernelConfig::new(valid_path.clone(), None);
        assert!(kernel.is_ok());
        {
            let kernel = kernel.unwrap();
            assert_eq!(kernel.kernel_path.to_str().unwrap(), valid_path);
        }
    }

    #[test]
    fn test_fail_new_kernelconfig() {
        // This is an invalid file
        let valid_path = String::from("./Cargo.tomle");
        let kernel = KernelConfig::new(valid_path.clone(), None);
        assert!(kernel.is_err());
    }

    #[test]
    fn test_sucess_new_with_cmd_kernelconfig() {
        // As we know Cargo.toml exists, we ensure a OK result
        let valid_path = String::from("./Cargo.toml");
        let cmdline = String::from(KERNEL_CMDLINE_DEFAULT);
        let kernel = KernelConfig::new(valid_path.clone(), Some(cmdline.clone()));
        assert!(kernel.is_ok());

        {
            let kernel = kernel.unwrap();
            assert_eq!(kernel.cmdline.as_str(), cmdline);
            assert_eq!(kernel.kernel_path.to_str().unwrap(), valid_path);
        }
    }

    #[test]
    fn scheduler_choice_parses_known_names() {
        assert_eq!(SchedulerChoice::try_from("bvt").unwrap(), SchedulerChoice::Bvt);
        assert_eq!(SchedulerChoice::try_from("iorr").unwrap(), SchedulerChoice::Iorr);
        assert!(SchedulerChoice::try_from("made-up").is_err());
    }

    #[test]
    fn default_scheduler_choice_is_iorr() {
        assert_eq!(SchedulerChoice::default(), SchedulerChoice::Iorr);
    }
}

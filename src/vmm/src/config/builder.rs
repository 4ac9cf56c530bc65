use crate::config::{KernelConfig, SchedulerChoice, VMMConfig};

impl VMMConfig {
    /// Create the builder to generate a vmm config
    pub fn builder(num_vcpus: u8, mem_size_mb: u32, kernel_path: &str) -> VMMConfigBuilder {
        VMMConfigBuilder::new(num_vcpus, mem_size_mb, kernel_path)
    }
}

/// See VMMConfig for explanation about these options
#[derive(Debug, Default)]
pub struct VMMConfigBuilder {
    kernel: String,
    cpus: u8,
    memory: u32,
    verbose: i32,
    console: Option<String>,
    scheduler: SchedulerChoice,
    ptirq_delay_ms: u64,
}

impl VMMConfigBuilder {
    /// This method should be called when config is done, it generates the needed config
    pub fn build(self) -> Result<VMMConfig, crate::config::Error> {
        Ok(VMMConfig {
            kernel: KernelConfig::new(self.kernel, None)?,
            cpus: self.cpus,
            memory: self.memory,
            verbose: self.verbose,
            console: self.console,
            scheduler: self.scheduler,
            ptirq_delay_ms: self.ptirq_delay_ms,
        })
    }
}

impl VMMConfigBuilder {
    // TODO: Maybe add a management of errors (e.g. checking kernel_path exists here)
    pub fn new(num_vcpus: u8, mem_size_mb: u32, kernel_path: &str) -> Self {
        VMMConfigBuilder {
            cpus: num_vcpus,
            memory: mem_size_mb,
            kernel: kernel_path.to_string(),
            ..Default::default()
        }
    }

    pub fn verbose(mut self, lvl: i32) -> Self {
        self.verbose = lvl;
        self
    }

    pub fn console(mut self, console: Option<String>) -> Self {
        self.console = console;
        self
    }

    pub fn scheduler(mut self, scheduler: SchedulerChoice) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn ptirq_delay_ms(mut self, delay: u64) -> Self {
        self.ptirq_delay_ms = delay;
        self
    }
}

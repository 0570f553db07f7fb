//! Purge command implementation.

use clap::Args;
use vmhost::config::AgentConfig;
use vmhost::executor::SystemExecutor;
use vmhost::paths::VmIdentity;
use vmhost::Lifecycle;

/// Remove a VM.
#[derive(Args, Debug)]
pub struct PurgeCmd {
    /// VM name.
    pub vm: String,
}

impl PurgeCmd {
    /// Execute the purge command.
    pub fn run(self, config: &AgentConfig) -> vmhost::Result<()> {
        let vm = VmIdentity::new(self.vm)?;
        Lifecycle::new(&SystemExecutor, config, &vm).purge()?;
        println!("Purged VM: {}", vm);
        Ok(())
    }
}

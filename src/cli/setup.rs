//! Setup command implementation.

use clap::Args;
use std::path::PathBuf;
use vmhost::config::AgentConfig;
use vmhost::error::Error;
use vmhost::executor::SystemExecutor;
use vmhost::paths::VmIdentity;
use vmhost::Lifecycle;

/// Provision a VM.
#[derive(Args, Debug)]
pub struct SetupCmd {
    /// VM name.
    pub vm: String,

    /// Parameter document, or `-` for stdin.
    #[arg(long, value_name = "FILE")]
    pub params: PathBuf,
}

impl SetupCmd {
    /// Execute the setup command.
    pub fn run(self, config: &AgentConfig) -> vmhost::Result<()> {
        let vm = VmIdentity::new(self.vm)?;
        let (params, secrets) = super::read_inputs(Some(&self.params))?;
        let params = params.ok_or_else(|| Error::params("missing parameter document"))?;

        Lifecycle::new(&SystemExecutor, config, &vm).setup(&params, &secrets)?;
        println!("Set up VM: {}", vm);
        Ok(())
    }
}

//! Recreate-unpersisted command implementation.

use clap::Args;
use std::path::PathBuf;
use vmhost::config::AgentConfig;
use vmhost::error::Error;
use vmhost::executor::SystemExecutor;
use vmhost::paths::VmIdentity;
use vmhost::Lifecycle;

/// Rebuild a VM's non-persistent resources after a host reboot.
#[derive(Args, Debug)]
pub struct RecreateCmd {
    /// VM name.
    pub vm: String,

    /// Parameter document, or `-` for stdin. Defaults to the manifest
    /// written by setup.
    #[arg(long, value_name = "FILE")]
    pub params: Option<PathBuf>,
}

impl RecreateCmd {
    /// Execute the recreate command.
    pub fn run(self, config: &AgentConfig) -> vmhost::Result<()> {
        let vm = VmIdentity::new(self.vm)?;
        let lifecycle = Lifecycle::new(&SystemExecutor, config, &vm);

        let (params, secrets) = super::read_inputs(self.params.as_deref())?;
        let params = match params {
            Some(params) => params,
            None => lifecycle.load_manifest()?.ok_or_else(|| {
                Error::params(format!(
                    "no manifest at {}; was the vm set up?",
                    lifecycle.paths().manifest().display()
                ))
            })?,
        };

        lifecycle.recreate_unpersisted(&params, &secrets)?;
        println!("Recreated VM: {}", vm);
        Ok(())
    }
}

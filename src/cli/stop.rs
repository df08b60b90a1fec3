//! `stopvm` command implementation.

use clap::Args;
use std::time::Duration;
use vboxctl::ops;
use vboxctl::Result;

use super::Context;

/// Power down a running machine.
#[derive(Args, Debug)]
pub struct StopVmCmd {
    /// Machine name or UUID (defaults to --vm).
    pub vm: Option<String>,

    /// How long to wait for the machine to stop.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

impl StopVmCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let name = ctx.vm_name(self.vm)?;
        let tracker = ctx.tracker();

        ctx.with_session(|session| {
            println!("Stopping VM {}...", name);
            let info = ops::stop_vm(session, &name, self.timeout, &tracker)?;
            println!("VM '{}' stopped, state={}", info.name, info.state);
            Ok(())
        })
    }
}

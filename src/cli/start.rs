//! `startvm` command implementation.

use clap::Args;
use std::time::Duration;
use vboxctl::ops;
use vboxctl::Result;

use super::Context;

/// Start a machine and wait until it runs.
#[derive(Args, Debug)]
pub struct StartVmCmd {
    /// Machine name or UUID (defaults to --vm).
    pub vm: Option<String>,

    /// Session type: gui, headless, sdl or separate.
    #[arg(long = "type", value_name = "TYPE")]
    pub kind: Option<String>,

    /// How long to wait for the machine to come up.
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

impl StartVmCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let name = ctx.vm_name(self.vm)?;
        let kind = self.kind.unwrap_or_else(|| ctx.config.start_type.clone());
        let tracker = ctx.tracker();

        ctx.with_session(|session| {
            println!("Starting VM {} ({})...", name, kind);
            let info = ops::start_vm(session, &name, &kind, self.timeout, &tracker)?;
            println!("VM '{}' started, state={}", info.name, info.state);
            Ok(())
        })
    }
}

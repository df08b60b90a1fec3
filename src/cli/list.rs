//! `list` command implementation.

use clap::Subcommand;
use vboxctl::Result;
use vboxctl_protocol::HostInfo;

use super::Context;

/// List host properties.
#[derive(Subcommand, Debug)]
pub enum ListCmd {
    /// Host hardware and operating system.
    Hostinfo,
}

impl ListCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        match self {
            ListCmd::Hostinfo => ctx.with_session(|session| {
                let host = session.host()?;
                let info = host.info()?;
                print!("{}", format_host(&info));
                if let Err(e) = host.release() {
                    tracing::debug!(error = %e, "failed to release host");
                }
                Ok(())
            }),
        }
    }
}

pub fn format_host(info: &HostInfo) -> String {
    format!(
        "Host Information:\n\n\
         Processor online count: {}\n\
         Processor count: {}\n\
         Processor speed: {} MHz\n\
         Processor description: {}\n\
         Memory size: {} MByte\n\
         Memory available: {} MByte\n\
         Operating system: {}\n\
         Operating system version: {}\n",
        info.processor_online_count,
        info.processor_count,
        info.processor_speed_mhz,
        info.processor_description,
        info.memory_size_mb,
        info.memory_available_mb,
        info.operating_system,
        info.os_version
    )
}

//! `version` command implementation.

use clap::Args;
use vboxctl::Result;

use super::Context;

/// Print client and server versions.
#[derive(Args, Debug)]
pub struct VersionCmd {}

impl VersionCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        println!("vboxctl {}", vboxctl::VERSION);
        ctx.with_session(|session| {
            let v = session.version()?;
            println!("server {} r{} (API {})", v.version, v.revision, v.api_version);
            Ok(())
        })
    }
}

//! `showlog` and `findlog` command implementations.

use clap::Args;
use std::io::Write;
use vboxctl::logs::{find_in_log, LogReader, SEARCH_CHUNK_SIZE};
use vboxctl::{ops, Error, Result};

use super::Context;

/// Print a machine log.
#[derive(Args, Debug)]
pub struct ShowLogCmd {
    /// Machine name or UUID (defaults to --vm).
    pub vm: Option<String>,

    /// Log index; 0 is the current log.
    #[arg(long, default_value_t = 0)]
    pub log: u32,
}

impl ShowLogCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let name = ctx.vm_name(self.vm)?;
        let chunk_size = ctx.config.log_chunk_size;

        ctx.with_session(|session| {
            ops::with_machine(session, &name, |machine| {
                let filename = machine.log_filename(self.log)?;
                tracing::debug!(vm = %name, file = %filename, "dumping log");

                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for chunk in LogReader::new(machine, self.log, chunk_size) {
                    out.write_all(&chunk?)?;
                }
                out.flush()?;
                Ok(())
            })
        })
    }
}

/// Print log lines matching a regular expression.
#[derive(Args, Debug)]
pub struct FindLogCmd {
    /// `[VM] PATTERN`; the machine defaults to --vm.
    #[arg(required = true, num_args = 1..=2, value_names = ["VM", "PATTERN"])]
    pub args: Vec<String>,

    /// Log index; 0 is the current log.
    #[arg(long, default_value_t = 0)]
    pub log: u32,
}

impl FindLogCmd {
    /// Split the positional arguments into machine and pattern.
    fn target(&self, ctx: &Context) -> Result<(String, String)> {
        match self.args.as_slice() {
            [pattern] => Ok((ctx.vm_name(None)?, pattern.clone())),
            [vm, pattern] => Ok((vm.clone(), pattern.clone())),
            _ => Err(Error::Config("expected [VM] PATTERN".into())),
        }
    }

    pub fn run(self, ctx: &Context) -> Result<()> {
        let (name, pattern) = self.target(ctx)?;

        ctx.with_session(|session| {
            let matches = ops::with_machine(session, &name, |machine| {
                find_in_log(machine, self.log, &pattern, SEARCH_CHUNK_SIZE)
            })?;
            for m in &matches {
                println!("{}: {}", m.line_number, m.line);
            }
            tracing::debug!(vm = %name, count = matches.len(), "log search finished");
            Ok(())
        })
    }
}

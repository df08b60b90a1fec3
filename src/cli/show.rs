//! `show` command implementation.

use clap::Subcommand;
use vboxctl::{ops, Result};
use vboxctl_protocol::MachineInfo;

use super::Context;

/// Show registered objects.
#[derive(Subcommand, Debug)]
pub enum ShowCmd {
    /// List registered machines.
    Vms,
}

impl ShowCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        match self {
            ShowCmd::Vms => ctx.with_session(|session| {
                let machines = ops::list_machines(session)?;
                if machines.is_empty() {
                    println!("No machines registered");
                }
                for info in &machines {
                    println!("{}", format_machine(info));
                }
                Ok(())
            }),
        }
    }
}

/// One-line summary of a machine.
pub fn format_machine(info: &MachineInfo) -> String {
    if !info.accessible {
        return format!("Machine {} [{}]: inaccessible", info.name, info.id);
    }
    format!(
        "Machine '{}' [{}], state={}, session={}, os={}, cpus={}, ram={} MB",
        info.name,
        info.id,
        info.state,
        info.session_state,
        info.os_type_id,
        info.cpu_count,
        info.memory_size_mb
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vboxctl_protocol::{MachineState, SessionState};

    fn info(accessible: bool) -> MachineInfo {
        MachineInfo {
            id: "1b2c".into(),
            name: "alpine".into(),
            os_type_id: "Linux_64".into(),
            accessible,
            state: MachineState::Running,
            session_state: SessionState::Locked,
            memory_size_mb: 512,
            cpu_count: 2,
            log_count: 2,
        }
    }

    #[test]
    fn test_format_machine() {
        let line = format_machine(&info(true));
        assert!(line.starts_with("Machine 'alpine' [1b2c]"));
        assert!(line.contains("ram=512 MB"));
        assert!(format_machine(&info(false)).ends_with("inaccessible"));
    }
}

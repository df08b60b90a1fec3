//! Simulated machines.

use vboxctl_protocol::{MachineInfo, MachineState, SessionState};

/// Configuration of one seeded machine.
#[derive(Debug, Clone)]
pub struct MachineSpec {
    /// Machine name.
    pub name: String,
    /// Guest OS type identifier.
    pub os_type_id: String,
    /// Guest RAM in MiB.
    pub memory_size_mb: u32,
    /// Number of vCPUs.
    pub cpu_count: u32,
    /// Whether the machine settings could be loaded.
    pub accessible: bool,
    /// If set, launching completes with this failure.
    pub launch_error: Option<String>,
    /// Number of filler lines in the initial `VBox.log`.
    pub log_lines: usize,
}

impl MachineSpec {
    /// A powered-off, accessible machine.
    pub fn new(name: impl Into<String>, os_type_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os_type_id: os_type_id.into(),
            memory_size_mb: 1024,
            cpu_count: 1,
            accessible: true,
            launch_error: None,
            log_lines: 40,
        }
    }

    /// Set guest resources.
    pub fn with_resources(mut self, cpu_count: u32, memory_size_mb: u32) -> Self {
        self.cpu_count = cpu_count;
        self.memory_size_mb = memory_size_mb;
        self
    }

    /// Make every launch of this machine fail with `message`.
    pub fn failing_launch(mut self, message: impl Into<String>) -> Self {
        self.launch_error = Some(message.into());
        self
    }

    /// Set the number of filler lines in the initial log.
    pub fn with_log_lines(mut self, lines: usize) -> Self {
        self.log_lines = lines;
        self
    }
}

/// Runtime state of a machine.
pub(crate) struct SimMachine {
    pub spec: MachineSpec,
    pub id: String,
    pub state: MachineState,
    pub session_state: SessionState,
    pub logs: Vec<Vec<u8>>,
    /// Base for the log timestamps, in milliseconds since boot.
    clock_ms: u64,
}

impl SimMachine {
    pub fn new(spec: MachineSpec, version: &str) -> Self {
        let id = machine_uuid(&spec.name);
        let mut machine = Self {
            spec,
            id,
            state: MachineState::PoweredOff,
            session_state: SessionState::Unlocked,
            logs: vec![Vec::new(), Vec::new()],
            clock_ms: 0,
        };

        machine.log(1, &format!("VirtualBox VM {} (previous run)", version));
        machine.log(1, "Power off requested");

        machine.log(0, &format!("VirtualBox VM {} starting up", version));
        machine.log(0, &format!("Machine name: {}", machine.spec.name));
        machine.log(0, &format!("Machine UUID: {}", machine.id));
        machine.log(0, &format!("Guest OS type: {}", machine.spec.os_type_id));
        for i in 0..machine.spec.log_lines {
            machine.log(0, &format!("CFGM: /Devices/ahci/0/LUN#{}/Config ok", i));
        }
        machine
    }

    /// Append a timestamped line to log `index`.
    pub fn log(&mut self, index: usize, line: &str) {
        self.clock_ms += 137;
        let ms = self.clock_ms;
        let stamp = format!(
            "{:02}:{:02}:{:02}.{:06}",
            ms / 3_600_000,
            (ms / 60_000) % 60,
            (ms / 1000) % 60,
            (ms % 1000) * 1000
        );
        if let Some(buf) = self.logs.get_mut(index) {
            buf.extend_from_slice(stamp.as_bytes());
            buf.push(b' ');
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
    }

    pub fn info(&self) -> MachineInfo {
        MachineInfo {
            id: self.id.clone(),
            name: if self.spec.accessible {
                self.spec.name.clone()
            } else {
                "<inaccessible>".to_string()
            },
            os_type_id: self.spec.os_type_id.clone(),
            accessible: self.spec.accessible,
            state: self.state,
            session_state: self.session_state,
            memory_size_mb: self.spec.memory_size_mb,
            cpu_count: self.spec.cpu_count,
            log_count: self.logs.len() as u32,
        }
    }
}

/// Derive a stable UUID-shaped identifier from a machine name.
fn machine_uuid(name: &str) -> String {
    let a = fnv1a(name.as_bytes(), 0xcbf2_9ce4_8422_2325);
    let b = fnv1a(name.as_bytes(), a);
    format!(
        "{:08x}-{:04x}-4{:03x}-8{:03x}-{:012x}",
        (a >> 32) as u32,
        (a >> 16) as u16,
        (a & 0xfff) as u16,
        (b >> 52) as u16 & 0xfff,
        b & 0xffff_ffff_ffff
    )
}

fn fnv1a(bytes: &[u8], seed: u64) -> u64 {
    bytes.iter().fold(seed, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_uuid_stable_and_distinct() {
        let a = machine_uuid("alpine");
        assert_eq!(a, machine_uuid("alpine"));
        assert_ne!(a, machine_uuid("debian"));
        assert_eq!(a.len(), 36);
        assert_eq!(a.split('-').count(), 5);
    }

    #[test]
    fn test_initial_logs() {
        let m = SimMachine::new(MachineSpec::new("alpine", "Linux_64").with_log_lines(3), "7.0.0");
        let log = String::from_utf8(m.logs[0].clone()).unwrap();
        assert_eq!(log.lines().count(), 4 + 3);
        assert!(log.contains("Machine name: alpine"));
        assert!(!m.logs[1].is_empty());
    }

    #[test]
    fn test_inaccessible_name() {
        let mut spec = MachineSpec::new("broken", "Other");
        spec.accessible = false;
        let m = SimMachine::new(spec, "7.0.0");
        assert_eq!(m.info().name, "<inaccessible>");
    }
}

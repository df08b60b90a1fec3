//! Simulated performance collector.
//!
//! Each configured (metric, object) pair owns a ring buffer of `count`
//! samples taken every `period` seconds. Guest metrics only sample while the
//! machine is online.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use vboxctl_protocol::{MetricDescriptor, MetricsData, ObjectRef};

/// Object a metric is measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Target {
    Host,
    Machine(usize),
}

/// Static definition of a base metric.
pub(crate) struct MetricDef {
    pub name: &'static str,
    pub on_machine: bool,
    pub unit: &'static str,
    pub scale: u32,
    pub minimum: i64,
    pub maximum: i64,
    pub description: &'static str,
}

const fn def(
    name: &'static str,
    on_machine: bool,
    unit: &'static str,
    scale: u32,
    maximum: i64,
    description: &'static str,
) -> MetricDef {
    MetricDef {
        name,
        on_machine,
        unit,
        scale,
        minimum: 0,
        maximum,
        description,
    }
}

pub(crate) const METRICS: &[MetricDef] = &[
    def("CPU/Load/User", false, "%", 1000, 100_000, "Percentage of processor time spent in user mode."),
    def("CPU/Load/Kernel", false, "%", 1000, 100_000, "Percentage of processor time spent in kernel mode."),
    def("CPU/MHz", false, "MHz", 1, i32::MAX as i64, "Average of current frequency of all processors."),
    def("RAM/Usage/Total", false, "kB", 1, i32::MAX as i64, "Total physical memory installed."),
    def("RAM/Usage/Used", false, "kB", 1, i32::MAX as i64, "Physical memory currently occupied."),
    def("RAM/Usage/Free", false, "kB", 1, i32::MAX as i64, "Physical memory currently available to applications."),
    def("Guest/CPU/Load/User", true, "%", 1000, 100_000, "Percentage of processor time spent in user mode as seen by the guest."),
    def("Guest/CPU/Load/Kernel", true, "%", 1000, 100_000, "Percentage of processor time spent in kernel mode as seen by the guest."),
    def("Guest/RAM/Usage/Total", true, "kB", 1, i32::MAX as i64, "Total amount of physical guest RAM."),
    def("Guest/RAM/Usage/Free", true, "kB", 1, i32::MAX as i64, "Free amount of physical guest RAM."),
];

/// Glob match supporting `*` anywhere in the pattern.
pub(crate) fn pattern_matches(pattern: &str, name: &str) -> bool {
    fn go(p: &[u8], n: &[u8]) -> bool {
        match p.split_first() {
            None => n.is_empty(),
            Some((&b'*', rest)) => (0..=n.len()).any(|i| go(rest, &n[i..])),
            Some((c, rest)) => n.first() == Some(c) && go(rest, &n[1..]),
        }
    }
    go(pattern.as_bytes(), name.as_bytes())
}

/// Returns true if any of `patterns` matches `name`; empty means all.
pub(crate) fn any_matches(patterns: &[String], name: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| pattern_matches(p, name))
}

/// Inputs sampled alongside a metric.
pub(crate) struct SampleContext {
    pub host_memory_kb: i64,
    pub host_cpu_mhz: i64,
    pub guest_memory_kb: Option<i64>,
    pub guest_online: bool,
}

/// One configured metric.
pub(crate) struct MetricSlot {
    pub def: &'static MetricDef,
    pub target: Target,
    pub period: Duration,
    pub count: u32,
    pub enabled: bool,
    pub samples: VecDeque<i64>,
    pub sequence: u32,
    last_sample: Instant,
}

impl MetricSlot {
    /// Wire descriptor, naming the target as `object`.
    pub fn descriptor(&self, object: ObjectRef) -> MetricDescriptor {
        MetricDescriptor {
            name: self.def.name.to_string(),
            object,
            description: self.def.description.to_string(),
            unit: self.def.unit.to_string(),
            minimum: self.def.minimum,
            maximum: self.def.maximum,
            period: self.period.as_secs() as u32,
            count: self.count,
        }
    }

    fn push(&mut self, ctx: &SampleContext) {
        let value = sample_value(self.def, self.target, self.sequence, ctx);
        self.sequence = self.sequence.wrapping_add(1);
        if self.samples.len() == self.count as usize {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Take the samples due at `now`.
    pub fn advance(&mut self, now: Instant, ctx: &SampleContext) {
        if !self.enabled || now < self.last_sample + self.period {
            return;
        }
        let periods = (now - self.last_sample).as_millis() / self.period.as_millis().max(1);
        self.last_sample += self.period * periods as u32;
        if !self.def.on_machine || ctx.guest_online {
            for _ in 0..periods.min(u128::from(self.count)) {
                self.push(ctx);
            }
        }
    }
}

/// Deterministic sample values.
fn sample_value(def: &MetricDef, target: Target, sequence: u32, ctx: &SampleContext) -> i64 {
    let salt = match target {
        Target::Host => 7,
        Target::Machine(i) => 11 + i as i64 * 13,
    };
    let wobble = (i64::from(sequence) * 7919 + salt * 104_729) % 1000;

    match def.name {
        "CPU/Load/User" | "Guest/CPU/Load/User" => 5_000 + wobble * 40,
        "CPU/Load/Kernel" | "Guest/CPU/Load/Kernel" => 1_000 + wobble * 10,
        "CPU/MHz" => ctx.host_cpu_mhz,
        "RAM/Usage/Total" => ctx.host_memory_kb,
        "RAM/Usage/Used" => ctx.host_memory_kb / 2 + wobble * 64,
        "RAM/Usage/Free" => ctx.host_memory_kb / 2 - wobble * 64,
        "Guest/RAM/Usage/Total" => ctx.guest_memory_kb.unwrap_or(0),
        "Guest/RAM/Usage/Free" => ctx.guest_memory_kb.unwrap_or(0) / 3 + wobble * 16,
        _ => 0,
    }
}

/// The platform-wide performance collector.
pub(crate) struct Collector {
    pub slots: Vec<MetricSlot>,
}

impl Collector {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Configure `def` on `target`, replacing an existing configuration.
    ///
    /// The first sample is taken immediately.
    pub fn setup(
        &mut self,
        def: &'static MetricDef,
        target: Target,
        period: Duration,
        count: u32,
        now: Instant,
        ctx: &SampleContext,
    ) -> &MetricSlot {
        self.slots
            .retain(|s| !(s.def.name == def.name && s.target == target));
        let mut slot = MetricSlot {
            def,
            target,
            period,
            count,
            enabled: true,
            samples: VecDeque::with_capacity(count as usize),
            sequence: 0,
            last_sample: now,
        };
        if !def.on_machine || ctx.guest_online {
            slot.push(ctx);
        }
        self.slots.push(slot);
        &self.slots[self.slots.len() - 1]
    }

    /// Slots matching name patterns and (when non-empty) targets.
    pub fn matching<'a>(
        &'a self,
        names: &'a [String],
        targets: &'a [Target],
    ) -> impl Iterator<Item = &'a MetricSlot> + 'a {
        self.slots.iter().filter(move |s| {
            any_matches(names, s.def.name) && (targets.is_empty() || targets.contains(&s.target))
        })
    }

    /// Mutable variant of [`Collector::matching`].
    pub fn matching_mut<'a>(
        &'a mut self,
        names: &'a [String],
        targets: &'a [Target],
    ) -> impl Iterator<Item = &'a mut MetricSlot> + 'a {
        self.slots.iter_mut().filter(move |s| {
            any_matches(names, s.def.name) && (targets.is_empty() || targets.contains(&s.target))
        })
    }

    /// Flatten matching slots into the wire format.
    pub fn query(
        &self,
        names: &[String],
        targets: &[Target],
        mut object_of: impl FnMut(Target) -> ObjectRef,
    ) -> MetricsData {
        let mut data = MetricsData::default();
        for slot in self.matching(names, targets) {
            data.push(
                slot.def.name,
                object_of(slot.target),
                slot.def.unit,
                slot.def.scale,
                slot.sequence,
                slot.samples.iter().copied(),
            );
        }
        data
    }
}

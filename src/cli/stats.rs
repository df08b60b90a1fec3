//! `stats` command implementation.

use clap::Args;
use std::collections::HashMap;
use std::time::Duration;
use vboxctl::metrics::MetricSamples;
use vboxctl::objects::{Host, Machine};
use vboxctl::{ops, Result, Session};
use vboxctl_protocol::ObjectRef;

use super::Context;

/// Collect performance metrics from the host and machines.
#[derive(Args, Debug)]
pub struct StatsCmd {
    /// Restrict to one machine (defaults to --vm, else everything).
    pub vm: Option<String>,

    /// Metric name patterns.
    #[arg(long = "metric", default_values_t = ["*".to_string()])]
    pub metrics: Vec<String>,

    /// Sampling period in seconds.
    #[arg(long, default_value_t = 1)]
    pub period: u32,

    /// Samples kept per metric.
    #[arg(long, default_value_t = 10)]
    pub depth: u32,

    /// Print this many reports, one per period.
    #[arg(long, default_value_t = 1)]
    pub watch: u32,
}

impl StatsCmd {
    pub fn run(self, ctx: &Context) -> Result<()> {
        let vm = self.vm.clone().or_else(|| ctx.vm.clone());

        ctx.with_session(|session| {
            let targets = MetricTargets::collect(session, vm.as_deref())?;
            let result = self.sample(session, &targets);
            ops::first_error(result, targets.release(), "metric targets")
        })
    }

    fn sample(&self, session: &Session, targets: &MetricTargets) -> Result<()> {
        let handles = targets.handles();
        let metrics: Vec<&str> = self.metrics.iter().map(String::as_str).collect();

        let mut collector = session.performance_collector()?;
        let period = Duration::from_secs(u64::from(self.period));
        let result = (|| -> Result<()> {
            let configured = collector.setup(&metrics, &handles, self.period, self.depth)?;
            tracing::debug!(count = configured.len(), "metrics configured");

            for round in 0..self.watch.max(1) {
                if round > 0 {
                    std::thread::sleep(period);
                }
                let stats = ops::collect_stats(&collector, &metrics, &handles)?;
                print!("{}", format_stats(&stats, &targets.names));
            }
            Ok(())
        })();

        ops::first_error(result, collector.release(), "collector")
    }
}

/// Objects sampled by `stats`, held until the run ends.
struct MetricTargets {
    host: Option<Host>,
    machines: Vec<Machine>,
    /// Display names keyed by reference.
    names: HashMap<ObjectRef, String>,
}

impl MetricTargets {
    /// `vm` alone, or the host and every machine.
    fn collect(session: &Session, vm: Option<&str>) -> Result<Self> {
        let mut targets = MetricTargets {
            host: None,
            machines: Vec::new(),
            names: HashMap::new(),
        };
        let listed = (|| -> Result<()> {
            match vm {
                Some(vm) => targets.machines.push(session.find_vm(vm)?),
                None => {
                    let host = session.host()?;
                    targets.names.insert(host.handle(), "host".to_string());
                    targets.host = Some(host);
                    targets.machines = session.machines()?;
                }
            }
            for machine in &targets.machines {
                targets.names.insert(machine.handle(), machine.info()?.name);
            }
            Ok(())
        })();

        if let Err(e) = listed {
            return ops::first_error(Err(e), targets.release(), "metric targets");
        }
        Ok(targets)
    }

    fn handles(&self) -> Vec<ObjectRef> {
        self.names.keys().copied().collect()
    }

    fn release(&self) -> Result<()> {
        let host = self.host.as_ref().map_or(Ok(()), Host::release);
        host.and(ops::release_machines(&self.machines))
    }
}

/// One line per metric: `object name: samples`.
pub fn format_stats(stats: &[MetricSamples], names: &HashMap<ObjectRef, String>) -> String {
    let mut out = String::new();
    for m in stats {
        let object = names
            .get(&m.object)
            .cloned()
            .unwrap_or_else(|| m.object.to_string());
        let values = if m.samples.is_empty() {
            "-".to_string()
        } else {
            m.formatted().join(" ")
        };
        out.push_str(&format!("{:<8} {:<28} {}\n", object, m.name, values));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vboxctl::transport::{InProcessTransport, ReleasePolicy, Transport};
    use vboxctl::{Credentials, SessionManager};
    use vboxctl_sim::Platform;

    fn explicit() -> (Arc<Platform>, SessionManager) {
        let platform = Arc::new(Platform::demo());
        let transport: Arc<dyn Transport> = Arc::new(
            InProcessTransport::new(platform.clone()).with_release_policy(ReleasePolicy::Explicit),
        );
        (platform, SessionManager::new(transport))
    }

    #[test]
    fn test_targets_released() {
        let (platform, mut mgr) = explicit();
        let session = mgr.connect(&Credentials::default()).unwrap();
        let baseline = platform.stats().live_objects;

        let targets = MetricTargets::collect(session, None).unwrap();
        assert!(targets.names.values().any(|n| n == "host"));
        assert_eq!(targets.handles().len(), targets.machines.len() + 1);
        targets.release().unwrap();
        assert_eq!(platform.stats().live_objects, baseline);

        let targets = MetricTargets::collect(session, Some("alpine")).unwrap();
        assert_eq!(targets.names.values().collect::<Vec<_>>(), vec!["alpine"]);
        targets.release().unwrap();
        assert_eq!(platform.stats().live_objects, baseline);

        assert!(MetricTargets::collect(session, Some("nonexistent-name")).is_err());
        assert_eq!(platform.stats().live_objects, baseline);
    }

    #[test]
    fn test_format_stats() {
        let host = ObjectRef::new(1, 1, 1);
        let other = ObjectRef::new(1, 9, 1);
        let names = HashMap::from([(host, "host".to_string())]);
        let stats = vec![
            MetricSamples {
                name: "CPU/Load/User".into(),
                object: host,
                unit: "%".into(),
                scale: 1000,
                sequence_number: 2,
                samples: vec![12_500, 7_250],
            },
            MetricSamples {
                name: "Guest/RAM/Usage/Free".into(),
                object: other,
                unit: "kB".into(),
                scale: 1,
                sequence_number: 0,
                samples: vec![],
            },
        ];
        let text = format_stats(&stats, &names);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("host"));
        assert!(lines[0].ends_with("12.50% 7.25%"));
        assert!(lines[1].starts_with(&other.to_string()));
        assert!(lines[1].ends_with('-'));
    }
}

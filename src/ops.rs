//! Composite workflows built on the session API.
//!
//! Every workflow that takes a machine session releases it exactly once,
//! whether the operation succeeds, fails or times out. References obtained
//! along the way are released on every path too.

use crate::error::Result;
use crate::events::{Event, EventPoller, EventSource};
use crate::metrics::{MetricSamples, MetricsCollector};
use crate::objects::Machine;
use crate::progress::{deadline_after, Progress, ProgressTracker};
use crate::session::{MachineSession, Session};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vboxctl_protocol::{EventType, LockType, MachineInfo, ObjectRef};

/// Metrics configured on a freshly started machine.
pub const DEFAULT_METRICS: &[&str] = &["*"];
/// Sampling period of the default metrics.
pub const DEFAULT_METRICS_PERIOD: u32 = 10;
/// Ring buffer depth of the default metrics.
pub const DEFAULT_METRICS_DEPTH: u32 = 15;
/// Remote wait per event poll.
pub const EVENT_POLL_SLICE: Duration = Duration::from_millis(500);

/// Combine the result of an operation with the result of its cleanup.
///
/// The first error wins; a cleanup failure after an error is only logged.
pub fn first_error<T>(result: Result<T>, cleanup: Result<()>, what: &str) -> Result<T> {
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), cleanup) => {
            if let Err(cleanup) = cleanup {
                warn!(error = %cleanup, "failed to release {} after error", what);
            }
            Err(e)
        }
    }
}

/// Run `op` with a fresh machine session, then unlock it.
fn with_machine_session<T>(
    session: &Session,
    op: impl FnOnce(&mut MachineSession) -> Result<T>,
) -> Result<T> {
    let mut ms = session.session_object()?;
    let result = op(&mut ms);
    first_error(result, ms.unlock(), "machine session")
}

/// Look up a machine by ID, then by name, and run `op` on it.
///
/// The machine reference is released afterwards on every path.
pub fn with_machine<T>(
    session: &Session,
    name_or_id: &str,
    op: impl FnOnce(&Machine) -> Result<T>,
) -> Result<T> {
    let machine = session.find_vm(name_or_id)?;
    let result = op(&machine);
    first_error(result, machine.release(), "machine")
}

/// Release every machine in `machines`, returning the first failure.
pub fn release_machines(machines: &[Machine]) -> Result<()> {
    machines
        .iter()
        .map(Machine::release)
        .fold(Ok(()), |first, released| first.and(released))
}

/// Details of every registered machine.
///
/// Machines whose details can't be read are logged and skipped. All listed
/// references are released before returning.
pub fn list_machines(session: &Session) -> Result<Vec<MachineInfo>> {
    let machines = session.machines()?;
    let infos = machines
        .iter()
        .filter_map(|machine| match machine.info() {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(machine = %machine.handle(), error = %e, "failed to query machine");
                None
            }
        })
        .collect();
    release_machines(&machines)?;
    Ok(infos)
}

/// Wait for `progress`, check its result and release it.
fn finish(
    progress: Progress,
    tracker: &ProgressTracker,
    max_wait: Duration,
    operation: &str,
) -> Result<()> {
    let outcome = tracker
        .wait_or_timeout(&progress, max_wait, operation)
        .and_then(|()| progress.check_result().map(drop));
    first_error(outcome, progress.release(), "progress")
}

/// Start a machine and wait for it to come up.
///
/// Lookup goes by ID, then by name; an unknown machine fails with
/// [`crate::Error::VmNotFound`] before anything is launched.
pub fn start_vm(
    session: &Session,
    name_or_id: &str,
    kind: &str,
    max_wait: Duration,
    tracker: &ProgressTracker,
) -> Result<MachineInfo> {
    with_machine(session, name_or_id, |machine| {
        info!(vm = %name_or_id, kind, "starting machine");
        with_machine_session(session, |ms| {
            let progress = ms.launch(machine, kind)?;
            finish(progress, tracker, max_wait, "VM start")?;
            setup_default_metrics(session, machine);
            Ok(())
        })?;
        machine.info()
    })
}

/// Configure the default metrics on `machine`, ignoring failures.
fn setup_default_metrics(session: &Session, machine: &Machine) {
    let mut collector = match session.performance_collector() {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "no performance collector");
            return;
        }
    };
    match collector.setup(
        DEFAULT_METRICS,
        &[machine.handle()],
        DEFAULT_METRICS_PERIOD,
        DEFAULT_METRICS_DEPTH,
    ) {
        Ok(descriptors) => debug!(count = descriptors.len(), "default metrics enabled"),
        Err(e) => debug!(error = %e, "failed to set up default metrics"),
    }
    if let Err(e) = collector.release() {
        debug!(error = %e, "failed to release collector");
    }
}

/// Power down a running machine and wait for it to stop.
pub fn stop_vm(
    session: &Session,
    name_or_id: &str,
    max_wait: Duration,
    tracker: &ProgressTracker,
) -> Result<MachineInfo> {
    with_machine(session, name_or_id, |machine| {
        info!(vm = %name_or_id, "stopping machine");
        with_machine_session(session, |ms| {
            ms.lock(machine, LockType::Shared)?;
            let progress = ms.power_down()?;
            finish(progress, tracker, max_wait, "VM power down")
        })?;
        machine.info()
    })
}

/// Deliver events of `categories` to `handler` until `duration` elapses.
///
/// Each event is acknowledged after the handler returns. The listener is
/// unregistered on every exit path. Returns the number of events handled.
pub fn watch_events(
    session: &Session,
    categories: &[EventType],
    duration: Duration,
    handler: impl FnMut(&Event) -> Result<()>,
) -> Result<usize> {
    watch_events_sliced(session, categories, duration, EVENT_POLL_SLICE, handler)
}

/// [`watch_events`] with remote waits of at most `slice`.
pub fn watch_events_sliced(
    session: &Session,
    categories: &[EventType],
    duration: Duration,
    slice: Duration,
    handler: impl FnMut(&Event) -> Result<()>,
) -> Result<usize> {
    let source = session.event_source()?;
    let watched = watch_source(&source, categories, duration, slice, handler);
    first_error(watched, source.release(), "event source")
}

fn watch_source(
    source: &EventSource,
    categories: &[EventType],
    duration: Duration,
    slice: Duration,
    mut handler: impl FnMut(&Event) -> Result<()>,
) -> Result<usize> {
    let mut poller = EventPoller::register(source, categories)?;
    let deadline = deadline_after(duration);

    let mut handled = 0;
    let result = (|| -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let Some(event) = poller.poll(remaining.min(slice))? else {
                continue;
            };
            let outcome = handler(&event);
            poller.acknowledge(&event)?;
            outcome?;
            handled += 1;
        }
    })();

    let unregistered = poller.unregister();
    result?;
    unregistered?;
    Ok(handled)
}

/// Query metrics `names` on `targets` (all objects when empty).
pub fn collect_stats(
    collector: &MetricsCollector,
    names: &[&str],
    targets: &[ObjectRef],
) -> Result<Vec<MetricSamples>> {
    let stats = collector.query(names, targets)?;
    debug!(count = stats.len(), "metrics collected");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credentials, SessionManager};
    use crate::transport::testing::RecordingTransport;
    use crate::transport::{InProcessTransport, ReleasePolicy, Transport};
    use crate::Error;
    use std::sync::Arc;
    use vboxctl_protocol::events::MachineStateChangedEvent;
    use vboxctl_protocol::{MachineState, SessionState};
    use vboxctl_sim::{MachineSpec, Platform, SimConfig};

    struct Fixture {
        platform: Arc<Platform>,
        recorder: Arc<RecordingTransport>,
        mgr: SessionManager,
    }

    fn fixture(launch: Duration) -> Fixture {
        let platform = Arc::new(Platform::new(
            SimConfig::demo()
                .with_machine(MachineSpec::new("broken", "Other").failing_launch("VT-x is not available"))
                .with_durations(launch, Duration::from_millis(20)),
        ));
        let inner: Arc<dyn Transport> = Arc::new(
            InProcessTransport::new(platform.clone()).with_release_policy(ReleasePolicy::Explicit),
        );
        let recorder = Arc::new(RecordingTransport::new(inner));
        let mgr = SessionManager::new(recorder.clone());
        Fixture {
            platform,
            recorder,
            mgr,
        }
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(Duration::from_millis(10))
    }

    #[test]
    fn test_start_unknown_vm_never_launches() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        let err = start_vm(session, "nonexistent-name", "headless", Duration::from_secs(1), &tracker())
            .unwrap_err();
        assert!(matches!(err, Error::VmNotFound(_)));
        assert_eq!(err.to_string(), "can't find VM 'nonexistent-name'");
        assert_eq!(f.recorder.count("launch_vm_process"), 0);
        assert_eq!(f.recorder.count("get_session_object"), 0);
    }

    #[test]
    fn test_start_success_unlocks_once() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        let info = start_vm(session, "alpine", "headless", Duration::from_secs(5), &tracker()).unwrap();
        assert_eq!(info.state, MachineState::Running);
        assert_eq!(f.recorder.count("unlock_machine"), 1);
        assert_eq!(f.platform.stats().unlocks, 1);
        assert_eq!(f.platform.stats().launches, 1);

        // Default metrics are configured on the machine.
        let perf = session.performance_collector().unwrap();
        let machine = session.machine_by_name("alpine").unwrap();
        let configured = perf.metrics(&["*"], &[machine.handle()]).unwrap();
        assert!(!configured.is_empty());
        assert!(configured
            .iter()
            .all(|d| d.period == DEFAULT_METRICS_PERIOD && d.count == DEFAULT_METRICS_DEPTH));
    }

    #[test]
    fn test_start_by_id() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let id = session.machine_by_name("debian").unwrap().info().unwrap().id;

        let info = start_vm(session, &id, "headless", Duration::from_secs(5), &tracker()).unwrap();
        assert_eq!(info.name, "debian");
    }

    #[test]
    fn test_start_timeout_unlocks_once() {
        let mut f = fixture(Duration::from_secs(60));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        let err = start_vm(session, "alpine", "headless", Duration::from_millis(50), &tracker())
            .unwrap_err();
        assert!(matches!(err, Error::TimeoutExceeded { .. }));
        assert_eq!(f.recorder.count("unlock_machine"), 1);
        assert_eq!(f.platform.stats().unlocks, 1);
    }

    #[test]
    fn test_timed_out_start_releases_references() {
        let mut f = fixture(Duration::from_secs(60));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let baseline = f.platform.stats().live_objects;

        let err = start_vm(session, "alpine", "headless", Duration::from_millis(30), &tracker())
            .unwrap_err();
        assert!(matches!(err, Error::TimeoutExceeded { .. }));
        assert_eq!(f.platform.stats().live_objects, baseline);
        assert_eq!(f.recorder.count("release"), 3);
    }

    #[test]
    fn test_failed_start_and_stop_release_references() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let baseline = f.platform.stats().live_objects;

        start_vm(session, "broken", "headless", Duration::from_secs(5), &tracker()).unwrap_err();
        assert_eq!(f.platform.stats().live_objects, baseline);

        stop_vm(session, "alpine", Duration::from_secs(1), &tracker()).unwrap_err();
        assert_eq!(f.platform.stats().live_objects, baseline);
    }

    #[test]
    fn test_start_stop_release_references() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let baseline = f.platform.stats().live_objects;

        start_vm(session, "alpine", "headless", Duration::from_secs(5), &tracker()).unwrap();
        assert_eq!(f.platform.stats().live_objects, baseline);
        stop_vm(session, "alpine", Duration::from_secs(5), &tracker()).unwrap();
        assert_eq!(f.platform.stats().live_objects, baseline);
    }

    #[test]
    fn test_list_machines_releases_references() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let baseline = f.platform.stats().live_objects;

        let infos = list_machines(session).unwrap();
        assert!(infos.iter().any(|m| m.name == "alpine"));
        assert!(infos.iter().any(|m| m.name == "broken"));
        assert_eq!(f.recorder.count("release"), infos.len());
        assert_eq!(f.platform.stats().live_objects, baseline);
    }

    #[test]
    fn test_with_machine_releases_after_error() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let baseline = f.platform.stats().live_objects;

        let err = with_machine(session, "debian", |_| -> Result<()> {
            Err(Error::Protocol("refused".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(f.platform.stats().live_objects, baseline);
    }

    #[test]
    fn test_first_error_keeps_operation_error() {
        let err = first_error::<()>(
            Err(Error::Protocol("operation".to_string())),
            Err(Error::Transport("cleanup".to_string())),
            "object",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = first_error(Ok(1), Err(Error::Transport("cleanup".to_string())), "object").unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(first_error(Ok(1), Ok(()), "object").unwrap(), 1);
    }

    #[test]
    fn test_start_huge_timeout_does_not_overflow() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        let info = start_vm(session, "alpine", "headless", Duration::MAX, &tracker()).unwrap();
        assert_eq!(info.state, MachineState::Running);
    }

    #[test]
    fn test_start_failure_unlocks_once() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        let err = start_vm(session, "broken", "headless", Duration::from_secs(5), &tracker())
            .unwrap_err();
        assert!(matches!(err, Error::RemoteOperation { .. }));
        assert_eq!(err.chain()[0].text, "VT-x is not available");
        assert_eq!(f.recorder.count("unlock_machine"), 1);
        assert_eq!(f.platform.machine_state("broken"), Some(MachineState::PoweredOff));
    }

    #[test]
    fn test_start_then_stop() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        start_vm(session, "win11", "gui", Duration::from_secs(5), &tracker()).unwrap();
        let info = stop_vm(session, "win11", Duration::from_secs(5), &tracker()).unwrap();
        assert_eq!(info.state, MachineState::PoweredOff);
        assert_eq!(info.session_state, SessionState::Unlocked);
        assert_eq!(f.recorder.count("unlock_machine"), 2);
    }

    #[test]
    fn test_stop_powered_off_fails_and_unlocks() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();

        let err = stop_vm(session, "alpine", Duration::from_secs(1), &tracker()).unwrap_err();
        assert_eq!(err.result_code(), Some(vboxctl_protocol::codes::VBOX_E_INVALID_VM_STATE));
        assert_eq!(f.recorder.count("unlock_machine"), 1);
    }

    #[test]
    fn test_watch_events_dispatches_and_acknowledges() {
        let mut f = fixture(Duration::from_millis(20));
        let platform = f.platform.clone();
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        start_vm(session, "alpine", "headless", Duration::from_secs(5), &tracker()).unwrap();

        // Drive a state change from a second logon while watching.
        let other = Arc::new(InProcessTransport::new(platform.clone()));
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let mut mgr = SessionManager::new(other);
            let session = mgr.connect(&Credentials::default()).unwrap();
            stop_vm(session, "alpine", Duration::from_secs(5), &ProgressTracker::default()).unwrap();
        });

        let mut states = Vec::new();
        let handled = watch_events(session, &[EventType::MachineStateChanged], Duration::from_millis(800), |e| {
            if let Some(view) = e.downcast::<MachineStateChangedEvent>() {
                states.push(view.state);
            }
            Ok(())
        })
        .unwrap();
        stopper.join().unwrap();

        assert_eq!(handled, states.len());
        assert_eq!(states, vec![MachineState::Stopping, MachineState::PoweredOff]);
        let stats = platform.stats();
        assert_eq!(stats.registered_listeners, 0);
        assert_eq!(stats.unacknowledged_events, 0);
    }

    #[test]
    fn test_watch_events_handler_error_unregisters() {
        let mut f = fixture(Duration::from_millis(20));
        let platform = f.platform.clone();
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let baseline = platform.stats().live_objects;

        let other = Arc::new(InProcessTransport::new(platform.clone()));
        let locker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let mut mgr = SessionManager::new(other);
            let session = mgr.connect(&Credentials::default()).unwrap();
            let machine = session.machine_by_name("debian").unwrap();
            let mut ms = session.session_object().unwrap();
            ms.lock(&machine, LockType::Write).unwrap();
            ms.unlock().unwrap();
        });

        let err = watch_events(session, &[EventType::SessionStateChanged], Duration::from_secs(2), |_| {
            Err(Error::Protocol("handler refused event".to_string()))
        })
        .unwrap_err();
        locker.join().unwrap();

        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(platform.stats().registered_listeners, 0);
        assert_eq!(platform.stats().live_objects, baseline);
    }

    #[test]
    fn test_collect_stats() {
        let mut f = fixture(Duration::from_millis(20));
        let session = f.mgr.connect(&Credentials::default()).unwrap();
        let mut perf = session.performance_collector().unwrap();
        let host = session.host().unwrap();
        perf.setup(&["CPU/*"], &[host.handle()], 1, 3).unwrap();

        let stats = collect_stats(&perf, &["CPU/Load/User"], &[]).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].object, host.handle());
        assert_eq!(stats[0].samples.len(), 1);
        assert!(stats[0].formatted()[0].ends_with('%'));
        perf.release().unwrap();
    }
}

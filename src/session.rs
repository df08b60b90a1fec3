//! Session management.
//!
//! [`SessionManager`] owns one logon to one endpoint. [`Session`] is the
//! authenticated connection and root of all lookups. [`MachineSession`] is a
//! per-operation lock handle that is unlocked exactly once, on every path.

use crate::error::{Error, Result};
use crate::events::EventSource;
use crate::metrics::MetricsCollector;
use crate::objects::{Host, Machine, RemoteObject};
use crate::progress::Progress;
use crate::transport::{self, Transport};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vboxctl_protocol::{codes, ApiRequest, LockType, ObjectRef, VersionInfo};

/// Logon credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Connection lifecycle for one endpoint.
///
/// Logoff is attempted exactly once per successful logon: by
/// [`SessionManager::disconnect`] or, failing that, on drop.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    session: Option<Session>,
}

impl SessionManager {
    /// Create a manager for `transport`. Nothing is sent until `connect`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            session: None,
        }
    }

    /// Log on, or return the existing session.
    ///
    /// Fails with [`Error::Connection`] when the endpoint is unreachable or
    /// rejects the credentials.
    pub fn connect(&mut self, credentials: &Credentials) -> Result<&Session> {
        if self.session.is_none() {
            let root: ObjectRef = transport::invoke(
                self.transport.as_ref(),
                ApiRequest::Logon {
                    username: credentials.username.clone(),
                    password: credentials.password.clone(),
                },
            )
            .map_err(|e| match e {
                Error::RemoteOperation { message, result_code, .. } => Error::Connection(format!(
                    "logon to {} rejected: {} (rc={})",
                    self.transport.describe(),
                    message,
                    codes::describe(result_code)
                )),
                Error::Transport(message) => Error::Connection(message),
                other => other,
            })?;

            info!(endpoint = %self.transport.describe(), "logged on");
            self.session = Some(Session {
                root: RemoteObject::new(self.transport.clone(), root),
            });
        }

        self.session
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    /// The live session, if connected.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Returns true while a logon is active.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Log off. Safe to call repeatedly and when never connected.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.logoff(),
            None => Ok(()),
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!(error = %e, "logoff failed");
        }
    }
}

/// An authenticated connection.
#[derive(Debug)]
pub struct Session {
    root: RemoteObject,
}

impl Session {
    /// The root object.
    pub fn root(&self) -> &RemoteObject {
        &self.root
    }

    /// The transport behind this session.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.root.transport()
    }

    fn logoff(self) -> Result<()> {
        debug!(root = %self.root.handle(), "logging off");
        self.root.invoke(ApiRequest::Logoff {
            this: self.root.handle(),
        })
    }

    fn lookup(&self, request: ApiRequest) -> Result<RemoteObject> {
        let handle: ObjectRef = self.root.invoke(request)?;
        Ok(self.root.child(handle))
    }

    /// Server version.
    pub fn version(&self) -> Result<VersionInfo> {
        self.root.invoke(ApiRequest::GetVersion {
            this: self.root.handle(),
        })
    }

    /// The host object.
    pub fn host(&self) -> Result<Host> {
        self.lookup(ApiRequest::GetHost {
            this: self.root.handle(),
        })
        .map(Host::new)
    }

    /// All registered machines. The caller owns the returned references.
    pub fn machines(&self) -> Result<Vec<Machine>> {
        let handles: Vec<ObjectRef> = self.root.invoke(ApiRequest::GetMachines {
            this: self.root.handle(),
        })?;
        Ok(handles
            .into_iter()
            .map(|h| Machine::new(self.root.child(h)))
            .collect())
    }

    /// Look up a machine by UUID.
    pub fn machine_by_id(&self, id: &str) -> Result<Machine> {
        self.lookup(ApiRequest::GetMachine {
            this: self.root.handle(),
            id: id.to_string(),
        })
        .map(Machine::new)
    }

    /// Look up a machine by name.
    pub fn machine_by_name(&self, name: &str) -> Result<Machine> {
        self.lookup(ApiRequest::FindMachine {
            this: self.root.handle(),
            name: name.to_string(),
        })
        .map(Machine::new)
    }

    /// Look up a machine by ID, then by name.
    ///
    /// A failed ID lookup is swallowed; only when the name lookup is refused
    /// too does this fail with [`Error::VmNotFound`].
    pub fn find_vm(&self, name_or_id: &str) -> Result<Machine> {
        match self.machine_by_id(name_or_id) {
            Ok(machine) => return Ok(machine),
            Err(e) => debug!(vm = %name_or_id, error = %e, "lookup by id failed, trying name"),
        }

        self.machine_by_name(name_or_id).map_err(|e| match e {
            Error::RemoteOperation { .. } => Error::VmNotFound(name_or_id.to_string()),
            other => other,
        })
    }

    /// A fresh, unlocked machine session.
    pub fn session_object(&self) -> Result<MachineSession> {
        self.lookup(ApiRequest::GetSessionObject {
            this: self.root.handle(),
        })
        .map(MachineSession::new)
    }

    /// The root event source.
    pub fn event_source(&self) -> Result<EventSource> {
        self.lookup(ApiRequest::GetEventSource {
            this: self.root.handle(),
        })
        .map(EventSource::new)
    }

    /// The performance collector.
    pub fn performance_collector(&self) -> Result<MetricsCollector> {
        self.lookup(ApiRequest::GetPerformanceCollector {
            this: self.root.handle(),
        })
        .map(MetricsCollector::new)
    }
}

/// Per-operation machine lock handle.
///
/// Locks are taken by [`MachineSession::lock`] or [`MachineSession::launch`]
/// and dropped by [`MachineSession::unlock`], which consumes the handle. A
/// handle dropped without unlocking unlocks itself.
#[derive(Debug)]
pub struct MachineSession {
    obj: RemoteObject,
    locked: bool,
    closed: bool,
}

impl MachineSession {
    fn new(obj: RemoteObject) -> Self {
        Self {
            obj,
            locked: false,
            closed: false,
        }
    }

    pub fn handle(&self) -> ObjectRef {
        self.obj.handle()
    }

    /// Returns true while the session holds a machine lock.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Lock `machine` into this session.
    pub fn lock(&mut self, machine: &Machine, lock_type: LockType) -> Result<()> {
        self.obj.invoke::<()>(ApiRequest::LockMachine {
            this: machine.handle(),
            session: self.obj.handle(),
            lock_type,
        })?;
        self.locked = true;
        Ok(())
    }

    /// Spawn the VM process of `machine`, locking it into this session.
    pub fn launch(&mut self, machine: &Machine, kind: &str) -> Result<Progress> {
        let progress: ObjectRef = self.obj.invoke(ApiRequest::LaunchVmProcess {
            this: machine.handle(),
            session: self.obj.handle(),
            kind: kind.to_string(),
        })?;
        self.locked = true;
        Ok(Progress::new(self.obj.child(progress)))
    }

    /// Power down the machine locked by this session.
    pub fn power_down(&self) -> Result<Progress> {
        let progress: ObjectRef = self.obj.invoke(ApiRequest::PowerDown {
            this: self.obj.handle(),
        })?;
        Ok(Progress::new(self.obj.child(progress)))
    }

    /// Unlock and release the session.
    pub fn unlock(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let unlocked = if self.locked {
            self.locked = false;
            self.obj.invoke::<()>(ApiRequest::UnlockMachine {
                this: self.obj.handle(),
            })
        } else {
            Ok(())
        };
        let released = self.obj.release();
        unlocked.and(released)
    }
}

impl Drop for MachineSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = %self.obj.handle(), error = %e, "failed to unlock machine session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use crate::transport::{InProcessTransport, ReleasePolicy};
    use vboxctl_sim::{Platform, SimConfig};

    fn platform() -> Arc<Platform> {
        Arc::new(Platform::new(SimConfig::demo().with_credentials("admin", "secret")))
    }

    fn admin() -> Credentials {
        Credentials::new("admin", "secret")
    }

    #[test]
    fn test_bad_credentials_then_cleanup() {
        let platform = platform();
        let mut mgr = SessionManager::new(Arc::new(InProcessTransport::new(platform.clone())));

        let err = mgr.connect(&Credentials::new("admin", "nope")).unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "{:?}", err);
        assert!(!mgr.is_connected());
        assert!(mgr.session().is_none());

        mgr.disconnect().unwrap();
        mgr.disconnect().unwrap();
        drop(mgr);
        assert_eq!(platform.stats().logoffs, 0);
    }

    #[test]
    fn test_logoff_exactly_once() {
        let platform = platform();
        let mut mgr = SessionManager::new(Arc::new(InProcessTransport::new(platform.clone())));
        mgr.connect(&admin()).unwrap();
        mgr.connect(&admin()).unwrap();
        assert_eq!(platform.stats().logons, 1);

        mgr.disconnect().unwrap();
        mgr.disconnect().unwrap();
        drop(mgr);
        assert_eq!(platform.stats().logoffs, 1);
    }

    #[test]
    fn test_drop_logs_off() {
        let platform = platform();
        {
            let mut mgr = SessionManager::new(Arc::new(InProcessTransport::new(platform.clone())));
            mgr.connect(&admin()).unwrap();
        }
        let stats = platform.stats();
        assert_eq!(stats.logoffs, 1);
        assert_eq!(stats.live_objects, 0);
    }

    #[test]
    fn test_independent_sessions() {
        let a = platform();
        let b = platform();
        let mut ma = SessionManager::new(Arc::new(InProcessTransport::new(a.clone())));
        let mut mb = SessionManager::new(Arc::new(InProcessTransport::new(b.clone())));
        ma.connect(&admin()).unwrap();
        let machine = mb.connect(&admin()).unwrap().machine_by_name("alpine").unwrap();

        ma.disconnect().unwrap();
        assert!(machine.info().is_ok());
        assert_eq!(b.stats().logoffs, 0);
    }

    #[test]
    fn test_find_vm_by_id_then_name() {
        let mut mgr = SessionManager::new(Arc::new(InProcessTransport::new(platform())));
        let session = mgr.connect(&admin()).unwrap();

        let by_name = session.find_vm("debian").unwrap();
        let id = by_name.info().unwrap().id;
        assert_eq!(session.find_vm(&id).unwrap().info().unwrap().name, "debian");

        let err = session.find_vm("nonexistent-name").unwrap_err();
        assert!(matches!(err, Error::VmNotFound(ref n) if n == "nonexistent-name"));
        assert_eq!(err.to_string(), "can't find VM 'nonexistent-name'");
    }

    #[test]
    fn test_machine_session_unlocks_once() {
        let inner: Arc<dyn Transport> = Arc::new(
            InProcessTransport::new(platform()).with_release_policy(ReleasePolicy::Explicit),
        );
        let recorder = Arc::new(RecordingTransport::new(inner));
        let mut mgr = SessionManager::new(recorder.clone());
        let session = mgr.connect(&admin()).unwrap();
        let machine = session.machine_by_name("alpine").unwrap();

        let mut ms = session.session_object().unwrap();
        ms.lock(&machine, LockType::Write).unwrap();
        assert!(ms.is_locked());
        ms.unlock().unwrap();
        assert_eq!(recorder.count("unlock_machine"), 1);
        assert_eq!(recorder.count("release"), 1);

        // Dropped while locked: the guard unlocks.
        {
            let mut ms = session.session_object().unwrap();
            ms.lock(&machine, LockType::Write).unwrap();
        }
        assert_eq!(recorder.count("unlock_machine"), 2);

        // Never locked: released, not unlocked.
        session.session_object().unwrap().unlock().unwrap();
        assert_eq!(recorder.count("unlock_machine"), 2);
        assert_eq!(recorder.count("release"), 3);
    }
}

//! Remote object handles.
//!
//! A [`RemoteObject`] is an [`ObjectRef`] paired with the transport it came
//! from. It owns no server state: every method is a remote call, and
//! [`RemoteObject::release`] is a message to the server rather than a
//! destructor.

use crate::error::Result;
use crate::transport::{self, ReleasePolicy, Transport};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use vboxctl_protocol::{ApiRequest, HostInfo, MachineInfo, ObjectRef};

/// A reference to a server-side object.
#[derive(Clone)]
pub struct RemoteObject {
    transport: Arc<dyn Transport>,
    handle: ObjectRef,
}

impl RemoteObject {
    /// Wrap a reference obtained through `transport`.
    pub fn new(transport: Arc<dyn Transport>, handle: ObjectRef) -> Self {
        Self { transport, handle }
    }

    /// The raw reference.
    pub fn handle(&self) -> ObjectRef {
        self.handle
    }

    /// The transport this reference belongs to.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Wrap another reference obtained through the same transport.
    pub fn child(&self, handle: ObjectRef) -> RemoteObject {
        RemoteObject::new(self.transport.clone(), handle)
    }

    /// Issue a request and decode its return value.
    pub fn invoke<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        transport::invoke(self.transport.as_ref(), request)
    }

    /// Release the reference on the server.
    ///
    /// A no-op when the transport reclaims references itself.
    pub fn release(&self) -> Result<()> {
        match self.transport.release_policy() {
            ReleasePolicy::Managed => Ok(()),
            ReleasePolicy::Explicit => self.invoke(ApiRequest::Release { this: self.handle }),
        }
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteObject").field(&self.handle).finish()
    }
}

/// The host the server runs on.
#[derive(Debug, Clone)]
pub struct Host {
    obj: RemoteObject,
}

impl Host {
    pub(crate) fn new(obj: RemoteObject) -> Self {
        Self { obj }
    }

    pub fn handle(&self) -> ObjectRef {
        self.obj.handle()
    }

    /// Host attributes.
    pub fn info(&self) -> Result<HostInfo> {
        self.obj.invoke(ApiRequest::GetHostInfo {
            this: self.obj.handle(),
        })
    }

    pub fn release(&self) -> Result<()> {
        self.obj.release()
    }
}

/// A registered virtual machine.
#[derive(Debug, Clone)]
pub struct Machine {
    obj: RemoteObject,
}

impl Machine {
    pub(crate) fn new(obj: RemoteObject) -> Self {
        Self { obj }
    }

    pub fn handle(&self) -> ObjectRef {
        self.obj.handle()
    }

    /// Machine attributes.
    pub fn info(&self) -> Result<MachineInfo> {
        self.obj.invoke(ApiRequest::GetMachineInfo {
            this: self.obj.handle(),
        })
    }

    /// Read up to `size` bytes of log `index` starting at `offset`.
    ///
    /// An empty chunk means the end of the log.
    pub fn read_log(&self, index: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        let chunk: vboxctl_protocol::LogChunk = self.obj.invoke(ApiRequest::ReadLog {
            this: self.obj.handle(),
            index,
            offset,
            size,
        })?;
        Ok(chunk.data)
    }

    /// File name of log `index`.
    pub fn log_filename(&self, index: u32) -> Result<String> {
        self.obj.invoke(ApiRequest::QueryLogFilename {
            this: self.obj.handle(),
            index,
        })
    }

    pub fn release(&self) -> Result<()> {
        self.obj.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcessTransport;
    use crate::Error;
    use vboxctl_sim::Platform;

    fn logon(transport: &Arc<dyn Transport>) -> RemoteObject {
        let root: ObjectRef = transport::invoke(
            transport.as_ref(),
            ApiRequest::Logon {
                username: String::new(),
                password: String::new(),
            },
        )
        .unwrap();
        RemoteObject::new(transport.clone(), root)
    }

    #[test]
    fn test_explicit_release_invalidates_reference() {
        let platform = Arc::new(Platform::demo());
        let transport: Arc<dyn Transport> = Arc::new(
            InProcessTransport::new(platform.clone()).with_release_policy(ReleasePolicy::Explicit),
        );
        let root = logon(&transport);
        let host = Host::new(root.child(root.invoke(ApiRequest::GetHost { this: root.handle() }).unwrap()));
        assert!(host.info().is_ok());

        let before = platform.stats().live_objects;
        host.release().unwrap();
        assert_eq!(platform.stats().live_objects, before - 1);
        assert!(matches!(host.info(), Err(Error::InvalidReference(_))));
    }

    #[test]
    fn test_managed_release_is_noop() {
        let platform = Arc::new(Platform::demo());
        let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(platform.clone()));
        let root = logon(&transport);
        let host = Host::new(root.child(root.invoke(ApiRequest::GetHost { this: root.handle() }).unwrap()));

        let before = platform.stats().live_objects;
        host.release().unwrap();
        assert_eq!(platform.stats().live_objects, before);
        assert!(host.info().is_ok());
    }
}

//! CLI command implementations.

pub mod events;
pub mod list;
pub mod log;
pub mod serve;
pub mod show;
pub mod start;
pub mod stats;
pub mod stop;
pub mod version;

use clap::Args;
use std::sync::Arc;
use vboxctl::config::ClientConfig;
use vboxctl::progress::ProgressTracker;
use vboxctl::transport::{InProcessTransport, Transport, WebServiceTransport};
use vboxctl::{ops, Credentials, Error, Result, Session, SessionManager};
use vboxctl_sim::Platform;

/// Options shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalOpts {
    /// Use the web-service binding instead of the in-process platform.
    #[arg(short = 'w', long = "webservice", global = true)]
    pub web: bool,

    /// Web-service endpoint URL.
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Logon user name.
    #[arg(long, global = true, value_name = "U")]
    pub user: Option<String>,

    /// Logon password.
    #[arg(long, global = true, value_name = "P")]
    pub passwd: Option<String>,

    /// Default machine for commands that take one.
    #[arg(long, global = true, value_name = "NAME")]
    pub vm: Option<String>,
}

/// Everything a command needs to reach the server.
pub struct Context {
    pub config: ClientConfig,
    pub vm: Option<String>,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
}

impl Context {
    /// Apply `opts` over `config` and build the selected binding.
    pub fn new(opts: GlobalOpts, mut config: ClientConfig) -> Result<Self> {
        if let Some(url) = opts.url {
            config.endpoint = url;
        }
        if let Some(user) = opts.user {
            config.username = user;
        }
        if let Some(passwd) = opts.passwd {
            config.password = passwd;
        }
        config.validate()?;

        let transport: Arc<dyn Transport> = if opts.web {
            Arc::new(WebServiceTransport::new(
                &config.endpoint,
                config.request_timeout(),
            )?)
        } else {
            Arc::new(InProcessTransport::new(Arc::new(Platform::demo())))
        };
        tracing::debug!(endpoint = %transport.describe(), "transport ready");

        Ok(Self {
            credentials: Credentials::new(&config.username, &config.password),
            vm: opts.vm,
            config,
            transport,
        })
    }

    /// Log on, run `f`, then log off.
    ///
    /// Logoff runs even when `f` fails; the first error is returned.
    pub fn with_session<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let mut manager = SessionManager::new(self.transport.clone());
        let session = manager.connect(&self.credentials)?;
        let result = f(session);

        ops::first_error(result, manager.disconnect(), "session")
    }

    /// Machine named on the command line, or the global `--vm`.
    pub fn vm_name(&self, arg: Option<String>) -> Result<String> {
        arg.or_else(|| self.vm.clone())
            .ok_or_else(|| Error::Config("no VM given (pass a name or --vm)".into()))
    }

    /// Progress tracker using the configured poll interval.
    pub fn tracker(&self) -> ProgressTracker {
        ProgressTracker::new(self.config.progress_poll())
    }
}

/// Print `error` with its result code and error chain.
pub fn report(error: &Error) {
    eprintln!("Error: {}", error.report());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let opts = GlobalOpts {
            url: Some("http://example.invalid:1234".into()),
            user: Some("admin".into()),
            vm: Some("alpine".into()),
            ..Default::default()
        };
        let ctx = Context::new(opts, ClientConfig::default()).unwrap();
        assert_eq!(ctx.config.endpoint, "http://example.invalid:1234");
        assert_eq!(ctx.config.username, "admin");
        assert_eq!(ctx.vm_name(None).unwrap(), "alpine");
        assert_eq!(ctx.vm_name(Some("debian".into())).unwrap(), "debian");
    }

    #[test]
    fn test_bad_url_rejected() {
        let opts = GlobalOpts {
            url: Some("ftp://nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            Context::new(opts, ClientConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_with_session_logs_off_after_failure() {
        let ctx = Context::new(GlobalOpts::default(), ClientConfig::default()).unwrap();
        let err = ctx
            .with_session(|session| session.find_vm("nonexistent-name").map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, Error::VmNotFound(_)));
        assert!(matches!(ctx.vm_name(None), Err(Error::Config(_))));
    }
}

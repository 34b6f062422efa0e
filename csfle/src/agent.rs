//! Crypto companion agent supervision.
//!
//! Automatic encryption needs a companion agent that analyzes query shapes
//! against the schema. The agent is either spawned from an executable path
//! or reached at a TCP endpoint. Its liveness is checked when a client is
//! built and again before every operation that could write or compare
//! protected data, so an unreachable agent fails the operation instead of
//! letting plaintext through.

use crate::error::Error;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Arguments passed to a spawned agent.
pub const DEFAULT_AGENT_ARGS: &[&str] = &["--idleShutdownTimeoutSecs=60"];

/// Where the crypto companion agent lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoAgentLocator {
    /// Executable to spawn
    Path(PathBuf),
    /// `host:port` of an already running agent
    Endpoint(String),
}

impl FromStr for CryptoAgentLocator {
    type Err = Error;

    /// Parses `tcp://host:port` as an endpoint and anything else as a path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("crypto agent location is empty".to_string()));
        }
        Ok(s.strip_prefix("tcp://")
            .map_or_else(|| Self::Path(PathBuf::from(s)), |addr| Self::Endpoint(addr.to_string())))
    }
}

impl fmt::Display for CryptoAgentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Endpoint(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// A running crypto companion agent.
pub trait CryptoAgent: Send + Sync {
    /// Confirms the agent is still reachable.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoAgentUnavailable` if it is not.
    fn check(&self) -> Result<(), Error>;
}

/// Agent spawned as a child process and killed when released.
pub struct ProcessAgent {
    path: PathBuf,
    child: Mutex<Child>,
}

impl ProcessAgent {
    /// Spawns the agent executable at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoAgentUnavailable` if the path is not a file, the
    /// process cannot be started, or it exits immediately.
    pub fn spawn(path: &Path, args: &[&str]) -> Result<Self, Error> {
        if !path.is_file() {
            return Err(Error::CryptoAgentUnavailable(format!(
                "no agent executable at {}",
                path.display()
            )));
        }

        let child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::CryptoAgentUnavailable(format!("cannot start {}: {e}", path.display()))
            })?;
        info!(agent = %path.display(), pid = child.id(), "spawned crypto agent");

        let agent = Self { path: path.to_path_buf(), child: Mutex::new(child) };
        agent.check()?;
        Ok(agent)
    }
}

impl CryptoAgent for ProcessAgent {
    fn check(&self) -> Result<(), Error> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(Error::CryptoAgentUnavailable(format!(
                "agent {} exited with {status}",
                self.path.display()
            ))),
            Err(e) => Err(Error::CryptoAgentUnavailable(format!(
                "cannot poll agent {}: {e}",
                self.path.display()
            ))),
        }
    }
}

impl Drop for ProcessAgent {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill() {
                warn!(agent = %self.path.display(), "failed to stop crypto agent: {e}");
            }
        }
        let _ = child.wait();
        debug!(agent = %self.path.display(), "released crypto agent");
    }
}

/// Agent reached over TCP.
pub struct EndpointAgent {
    addrs: Vec<SocketAddr>,
    timeout: Duration,
}

impl EndpointAgent {
    /// Resolves `endpoint` and checks that it accepts connections.
    ///
    /// # Errors
    ///
    /// Returns `Error::CryptoAgentUnavailable` if the endpoint cannot be
    /// resolved or reached within `timeout`.
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, Error> {
        let addrs: Vec<SocketAddr> = endpoint
            .to_socket_addrs()
            .map_err(|e| Error::CryptoAgentUnavailable(format!("cannot resolve {endpoint}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::CryptoAgentUnavailable(format!("{endpoint} resolved to nothing")));
        }
        let agent = Self { addrs, timeout };
        agent.check()?;
        debug!(endpoint, "crypto agent endpoint reachable");
        Ok(agent)
    }
}

impl CryptoAgent for EndpointAgent {
    fn check(&self) -> Result<(), Error> {
        let mut last_error = None;
        for addr in &self.addrs {
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(format!("{addr}: {e}")),
            }
        }
        Err(Error::CryptoAgentUnavailable(last_error.unwrap_or_default()))
    }
}

/// Starts or connects to the agent at `locator`.
///
/// # Errors
///
/// Returns `Error::CryptoAgentUnavailable` if the agent cannot be reached.
pub fn launch(locator: &CryptoAgentLocator, timeout: Duration) -> Result<Box<dyn CryptoAgent>, Error> {
    match locator {
        CryptoAgentLocator::Path(path) => Ok(Box::new(ProcessAgent::spawn(path, DEFAULT_AGENT_ARGS)?)),
        CryptoAgentLocator::Endpoint(addr) => Ok(Box::new(EndpointAgent::connect(addr, timeout)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_millis(500);

    #[test]
    fn test_locator_parse() {
        assert_eq!(
            "tcp://127.0.0.1:27020".parse::<CryptoAgentLocator>().unwrap(),
            CryptoAgentLocator::Endpoint("127.0.0.1:27020".to_string())
        );
        assert_eq!(
            "/usr/bin/mongocryptd".parse::<CryptoAgentLocator>().unwrap(),
            CryptoAgentLocator::Path(PathBuf::from("/usr/bin/mongocryptd"))
        );
        assert!(matches!("  ".parse::<CryptoAgentLocator>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_executable_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let locator = CryptoAgentLocator::Path(dir.path().join("mongocryptd"));
        assert!(matches!(launch(&locator, TIMEOUT), Err(Error::CryptoAgentUnavailable(_))));
    }

    #[test]
    fn test_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let locator = CryptoAgentLocator::Path(dir.path().to_path_buf());
        assert!(matches!(launch(&locator, TIMEOUT), Err(Error::CryptoAgentUnavailable(_))));
    }

    #[test]
    fn test_endpoint_reachable_then_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let agent = EndpointAgent::connect(&addr, TIMEOUT).unwrap();
        assert!(agent.check().is_ok());

        drop(listener);
        assert!(matches!(agent.check(), Err(Error::CryptoAgentUnavailable(_))));
    }

    #[test]
    fn test_unresolvable_endpoint() {
        let locator = CryptoAgentLocator::Endpoint("not a host".to_string());
        assert!(matches!(launch(&locator, TIMEOUT), Err(Error::CryptoAgentUnavailable(_))));
    }
}

//! Process-wide runtime configuration.
//!
//! A [`Config`] is built once at startup and handed by reference to the
//! [`SharedBlockAllocator`](crate::memory::SharedBlockAllocator) and the
//! [`Coral`](crate::protocol::Coral) client. Nothing in the runtime reads the
//! environment on its own; call [`Config::from_env`] to apply the usual
//! overrides.
//!
//! | Field | Default | Override |
//! |-------|---------|----------|
//! | `namespace` | `inaccel` | `INACCEL_NAMESPACE` |
//! | `shm_root` | `/dev/shm` | `INACCEL_SHM_ROOT` |
//! | `hostname` | `localhost` | `CORAL_HOSTNAME` |
//! | `port` | `55677` | `CORAL_PORT` |

use crate::error::{Error, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

/// Default namespace under which shared blocks are materialized.
pub const DEFAULT_NAMESPACE: &str = "inaccel";

/// Default directory holding namespaces.
pub const DEFAULT_SHM_ROOT: &str = "/dev/shm";

/// Default resource manager hostname.
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Default resource manager port.
pub const DEFAULT_PORT: u16 = 55677;

/// Environment variable overriding [`Config::namespace`].
pub const ENV_NAMESPACE: &str = "INACCEL_NAMESPACE";

/// Environment variable overriding [`Config::shm_root`].
pub const ENV_SHM_ROOT: &str = "INACCEL_SHM_ROOT";

/// Environment variable overriding [`Config::hostname`].
pub const ENV_HOSTNAME: &str = "CORAL_HOSTNAME";

/// Environment variable overriding [`Config::port`].
pub const ENV_PORT: &str = "CORAL_PORT";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Namespace shared with the resource manager; a subdirectory of `shm_root`.
    pub namespace: String,
    /// Directory in which namespaces live (normally a tmpfs).
    pub shm_root: PathBuf,
    /// Hostname of the resource manager.
    pub hostname: String,
    /// Listening port of the resource manager.
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            shm_root: PathBuf::from(DEFAULT_SHM_ROOT),
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Config {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from defaults plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `CORAL_PORT` is not a valid port number.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            config.namespace = namespace;
        }
        if let Some(root) = lookup(ENV_SHM_ROOT) {
            config.shm_root = PathBuf::from(root);
        }
        if let Some(hostname) = lookup(ENV_HOSTNAME) {
            config.hostname = hostname;
        }
        if let Some(port) = lookup(ENV_PORT) {
            config.port = port
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{ENV_PORT}={port:?}: {e}")))?;
        }

        Ok(config)
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the directory in which namespaces live.
    pub fn with_shm_root(mut self, root: impl AsRef<Path>) -> Self {
        self.shm_root = root.as_ref().to_path_buf();
        self
    }

    /// Set the resource manager hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the resource manager port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Directory where every shared block of this namespace is materialized.
    pub fn block_dir(&self) -> PathBuf {
        self.shm_root.join(&self.namespace)
    }

    /// Resolve the resource manager to an IPv4 socket address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the name does not resolve or has no
    /// IPv4 address.
    pub fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = (self.hostname.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::Connection)?;

        addrs.find(SocketAddr::is_ipv4).ok_or_else(|| {
            Error::Connection(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("{} has no IPv4 address", self.hostname),
            ))
        })
    }
}

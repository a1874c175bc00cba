//! Reader URIs and the scheme registry that turns them into transports.
//!
//! ```text
//! tmr://192.168.1.100        network reader, default port
//! tmr://reader.local:5084    network reader, explicit port
//! tmr:///dev/ttyUSB0         serial reader
//! tmr:///com3                serial reader (Windows port name)
//! ```

use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::config::ReaderConfig;
use crate::error::{ReaderError, Result};
use crate::reader::Reader;
use crate::tcp::TcpTransport;
use crate::transport::BoxedTransport;

/// Scheme handled by the built-in factory
pub const DEFAULT_SCHEME: &str = "tmr";

/// Port used for network readers when the URI names none
pub const DEFAULT_TCP_PORT: u16 = 8081;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { path: String },
    Network { host: String, port: Option<u16> },
}

/// A parsed reader address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderUri {
    scheme: String,
    endpoint: Endpoint,
    raw: String,
}

impl ReaderUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| ReaderError::InvalidUri(format!("{}: {}", uri, e)))?;

        let endpoint = match url.host_str() {
            Some(host) if !host.is_empty() => Endpoint::Network {
                host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
                port: url.port(),
            },
            _ => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(ReaderError::InvalidUri(format!("{}: no host or device path", uri)));
                }
                Endpoint::Serial {
                    path: serial_path(path),
                }
            }
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            endpoint,
            raw: uri.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// `/com3` names a Windows port, anything else is a device path
fn serial_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.len() > 3 && trimmed[..3].eq_ignore_ascii_case("com") && !trimmed.contains('/') {
        trimmed.to_string()
    } else {
        path.to_string()
    }
}

impl FromStr for ReaderUri {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ReaderUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Builds a transport for a URI
pub type TransportFactory = Box<dyn Fn(&ReaderUri, &ReaderConfig) -> Result<BoxedTransport> + Send + Sync>;

/// Maps URI schemes to transport factories.
///
/// Each registry is independent; there is no process-wide table.
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl Default for TransportRegistry {
    /// Registry with the `tmr` scheme installed
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(DEFAULT_SCHEME, default_factory);
        registry
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry without any scheme
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Install `factory` for `scheme`. Returns true if an earlier factory
    /// was replaced.
    pub fn register<F>(&mut self, scheme: &str, factory: F) -> bool
    where
        F: Fn(&ReaderUri, &ReaderConfig) -> Result<BoxedTransport> + Send + Sync + 'static,
    {
        self.factories
            .insert(scheme.to_ascii_lowercase(), Box::new(factory))
            .is_some()
    }

    pub fn unregister(&mut self, scheme: &str) -> bool {
        self.factories.remove(&scheme.to_ascii_lowercase()).is_some()
    }

    pub fn is_registered(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Build the transport for `uri` without opening it
    pub fn create(&self, uri: &str, config: &ReaderConfig) -> Result<BoxedTransport> {
        let uri = ReaderUri::parse(uri)?;
        let factory = self
            .factories
            .get(uri.scheme())
            .ok_or_else(|| ReaderError::InvalidUri(format!("Unknown scheme '{}' in {}", uri.scheme(), uri)))?;
        debug!("Creating transport for {} ({:?})", uri, uri.endpoint());
        factory(&uri, config)
    }

    /// Build the transport for `uri` and connect a reader over it
    pub fn connect(&self, uri: &str, config: ReaderConfig) -> Result<Reader<BoxedTransport>> {
        let transport = self.create(uri, &config)?;
        Reader::connect(transport, config)
    }
}

fn default_factory(uri: &ReaderUri, config: &ReaderConfig) -> Result<BoxedTransport> {
    match uri.endpoint() {
        Endpoint::Network { host, port } => Ok(Box::new(TcpTransport::new(host, port.unwrap_or(DEFAULT_TCP_PORT)))),
        Endpoint::Serial { path } => serial_transport(path, config),
    }
}

#[cfg(feature = "serial")]
fn serial_transport(path: &str, config: &ReaderConfig) -> Result<BoxedTransport> {
    Ok(Box::new(crate::serial::SerialTransport::new(path, config.baud_rate)))
}

#[cfg(not(feature = "serial"))]
fn serial_transport(path: &str, _config: &ReaderConfig) -> Result<BoxedTransport> {
    Err(ReaderError::InvalidUri(format!(
        "{} is a serial port but serial support is not enabled",
        path
    )))
}

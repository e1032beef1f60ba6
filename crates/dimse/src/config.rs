//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::{DimseError, Result};

/// Maximum length of an Application Entity title
pub const MAX_AE_TITLE_LEN: usize = 16;

/// A DICOM application entity: title plus optional network address.
///
/// A node without host and port can still act as the local calling AE,
/// but any operation that has to reach it over the network rejects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DicomNode {
    /// Application Entity Title
    pub ae_title: String,

    /// Host address
    #[serde(default)]
    pub host: Option<String>,

    /// Port
    #[serde(default)]
    pub port: Option<u16>,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

impl DicomNode {
    /// Create a node with only an AE title
    pub fn new(ae_title: impl Into<String>) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: None,
            port: None,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Create a node reachable at `host:port`
    pub fn remote(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(ae_title).with_address(host, port)
    }

    /// Set the network address of this node
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    /// Set only the port (used for local listening nodes)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Whether both host and port are known
    pub fn has_network_info(&self) -> bool {
        self.host.as_deref().is_some_and(|h| !h.is_empty()) && self.port.is_some()
    }

    /// Whether a port is known
    pub fn has_port(&self) -> bool {
        self.port.is_some()
    }

    /// `host:port` for connecting, or a configuration error
    pub fn socket_address(&self) -> Result<String> {
        match (self.host.as_deref(), self.port) {
            (Some(host), Some(port)) if !host.is_empty() => Ok(format!("{}:{}", host, port)),
            _ => Err(DimseError::config(format!(
                "Node {} has no network address (host and port are required)",
                self.ae_title
            ))),
        }
    }

    /// Fail unless the node can be reached over the network
    pub fn require_network_info(&self) -> Result<()> {
        self.validate()?;
        self.socket_address().map(|_| ())
    }

    /// Validate the AE title
    pub fn validate(&self) -> Result<()> {
        validate_ae_title(&self.ae_title)
    }
}

impl fmt::Display for DicomNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => write!(f, "{}@{}:{}", self.ae_title, host, port),
            (None, Some(port)) => write!(f, "{}@:{}", self.ae_title, port),
            _ => write!(f, "{}", self.ae_title),
        }
    }
}

/// Validate an AE title: 1-16 characters, not only spaces, no backslash or control characters
pub fn validate_ae_title(ae_title: &str) -> Result<()> {
    if ae_title.trim().is_empty() || ae_title.len() > MAX_AE_TITLE_LEN {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' must be 1-{} characters",
            ae_title, MAX_AE_TITLE_LEN
        )));
    }
    if ae_title.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(DimseError::InvalidAeTitle(format!(
            "'{}' contains a backslash or control character",
            ae_title
        )));
    }
    Ok(())
}

/// Configuration for DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local application entity used as calling AE and default move destination
    #[serde(default = "default_local_node")]
    pub local: DicomNode,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Read timeout on an established association in milliseconds
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// Maximum number of concurrent inbound associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Answer C-ECHO on the storage SCP
    #[serde(default = "default_true")]
    pub enable_echo: bool,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local: default_local_node(),
            bind_addr: default_bind_addr(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            association_timeout_ms: default_association_timeout(),
            max_associations: default_max_associations(),
            enable_echo: true,
        }
    }
}

impl DimseConfig {
    /// Configuration with the given local node and defaults elsewhere
    pub fn with_local(local: DicomNode) -> Self {
        Self {
            local,
            ..Self::default()
        }
    }

    /// Connection timeout for a node, honouring its override
    pub fn connect_timeout_for(&self, node: &DicomNode) -> Duration {
        Duration::from_millis(node.connect_timeout_ms.unwrap_or(self.connect_timeout_ms))
    }

    /// Get association timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Max PDU for a node, honouring its override
    pub fn max_pdu_for(&self, node: &DicomNode) -> u32 {
        node.max_pdu.unwrap_or(self.max_pdu)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.local.validate()?;

        if self.max_pdu < 4096 || self.max_pdu > 131_072 {
            return Err(DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(DimseError::config("max_associations must be at least 1"));
        }

        Ok(())
    }
}

// Default value functions
fn default_local_node() -> DicomNode {
    DicomNode::new("PACSFLOW")
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_max_pdu() -> u32 {
    16_384
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_association_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_max_associations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

//! Type-safe identifiers for agents and the addresses they live at.
//!
//! An [`AgentName`] names a logical service instance and never changes; the
//! [`PeerName`] it resolves to may change over the agent's lifetime as the
//! agent restarts or moves.
//!
//! ```
//! use agentwire_common::ids::{AgentName, PeerName};
//!
//! let name = AgentName::new("storage-03").unwrap();
//! assert_eq!(name.as_str(), "storage-03");
//!
//! let tcp: PeerName = "127.0.0.1:9000".parse().unwrap();
//! assert!(!tcp.is_unix());
//!
//! let uds: PeerName = "unix:/run/agents/storage-03.sock".parse().unwrap();
//! assert!(uds.is_unix());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::errors::RpcError;

/// Maximum length of an agent name in bytes.
pub const MAX_AGENT_NAME_LEN: usize = 64;

/// Cluster-scoped name of a logical agent.
///
/// Names are 1 to [`MAX_AGENT_NAME_LEN`] bytes of ASCII alphanumerics, `-`,
/// `_`, `.` and `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    /// Validate and wrap an agent name.
    pub fn new(name: impl Into<String>) -> Result<Self, RpcError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RpcError::InvalidAgentName("empty name".to_string()));
        }
        if name.len() > MAX_AGENT_NAME_LEN {
            return Err(RpcError::InvalidAgentName(format!(
                "{} bytes exceeds maximum of {}",
                name.len(),
                MAX_AGENT_NAME_LEN
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
        {
            return Err(RpcError::InvalidAgentName(format!(
                "invalid character {:?} in {:?}",
                c, name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for AgentName {
    type Error = RpcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AgentName> for String {
    fn from(name: AgentName) -> Self {
        name.0
    }
}

impl FromStr for AgentName {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Concrete network address of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerName {
    /// TCP socket address
    Tcp(SocketAddr),
    /// Unix domain socket path
    Unix(PathBuf),
}

impl PeerName {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, PeerName::Unix(_))
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            PeerName::Unix(path) => Some(path),
            PeerName::Tcp(_) => None,
        }
    }
}

impl From<SocketAddr> for PeerName {
    fn from(addr: SocketAddr) -> Self {
        PeerName::Tcp(addr)
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerName::Tcp(addr) => write!(f, "{}", addr),
            PeerName::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for PeerName {
    type Err = RpcError;

    /// Parse a peer address.
    ///
    /// Unix domain socket paths are recognised by a `unix:` prefix, a leading
    /// `/`, or a `.sock` extension; anything else must be a socket address.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(PeerName::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') || s.ends_with(".sock") {
            return Ok(PeerName::Unix(PathBuf::from(s)));
        }
        s.parse::<SocketAddr>()
            .map(PeerName::Tcp)
            .map_err(|e| RpcError::InvalidPeerName(format!("{}: {}", s, e)))
    }
}

impl Serialize for PeerName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_name_valid() {
        let name = AgentName::new("compute-7.rack:2").unwrap();
        assert_eq!(name.to_string(), "compute-7.rack:2");
    }

    #[test]
    fn test_agent_name_rejects_empty_and_long() {
        assert!(AgentName::new("").is_err());
        assert!(AgentName::new("a".repeat(MAX_AGENT_NAME_LEN)).is_ok());
        assert!(AgentName::new("a".repeat(MAX_AGENT_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_agent_name_rejects_bad_chars() {
        assert!(AgentName::new("has space").is_err());
        assert!(AgentName::new("slash/name").is_err());
    }

    #[test]
    fn test_agent_name_serde() {
        let name: AgentName = serde_json::from_str("\"coordinator\"").unwrap();
        assert_eq!(name.as_str(), "coordinator");
        assert!(serde_json::from_str::<AgentName>("\"bad name\"").is_err());
    }

    #[test]
    fn test_peer_name_parse() {
        assert_eq!(
            "unix:/var/run/agent.sock".parse::<PeerName>().unwrap(),
            PeerName::unix("/var/run/agent.sock")
        );
        assert!("/tmp/test.sock".parse::<PeerName>().unwrap().is_unix());
        assert!("agent.sock".parse::<PeerName>().unwrap().is_unix());

        let tcp: PeerName = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(tcp, PeerName::Tcp("127.0.0.1:8080".parse().unwrap()));

        assert!("localhost:50051".parse::<PeerName>().is_err());
    }

    #[test]
    fn test_peer_name_display_roundtrip() {
        for s in ["unix:/tmp/a.sock", "10.0.0.1:471"] {
            let peer: PeerName = s.parse().unwrap();
            assert_eq!(peer.to_string(), s);
        }
    }
}

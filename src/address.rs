//! Node addresses.
//!
//! An [`Address`] identifies a node endpoint by protocol scheme, actor system name, host and port, and has the
//! canonical string form `protocol://system@host:port`. The string form is also used as the serialized
//! representation, so addresses can be carried inside wire envelopes and handshakes.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::AddressParseError;

/// Identifies a node endpoint.
///
/// Two addresses are equal iff protocol, system, host and port all match. A port of `None` denotes an
/// address that has not been bound yet; [`Transport::listen`](crate::transport::Transport::listen) returns
/// the concrete form.
///
/// # Example
///
/// ```
/// use kameo_remoting::Address;
///
/// let addr: Address = "test://remote-sys@localhost:12346".parse().unwrap();
/// assert_eq!(addr.system(), "remote-sys");
/// assert_eq!(addr.port(), Some(12346));
/// assert_eq!(addr.to_string(), "test://remote-sys@localhost:12346");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address {
    protocol: String,
    system: String,
    host: String,
    port: Option<u16>,
}

impl Address {
    /// Creates a new address.
    pub fn new(
        protocol: impl Into<String>,
        system: impl Into<String>,
        host: impl Into<String>,
        port: Option<u16>,
    ) -> Self {
        Address {
            protocol: protocol.into(),
            system: system.into(),
            host: host.into(),
            port,
        }
    }

    /// Returns a copy of this address bound to `port`.
    pub fn with_port(&self, port: u16) -> Self {
        Address {
            port: Some(port),
            ..self.clone()
        }
    }

    /// The protocol scheme, e.g. `test` or `tcp`.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The actor system name.
    pub fn system(&self) -> &str {
        &self.system
    }

    /// The host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, or `None` if the address is not bound.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns `true` if the address carries a concrete port and can be reached from other nodes.
    pub fn has_global_scope(&self) -> bool {
        !self.host.is_empty() && self.port.is_some()
    }

    /// The `system@host:port` part of the address, used as a path element in remote deployment paths.
    ///
    /// A port on an address without a host is kept as `system@:port`.
    pub fn authority(&self) -> String {
        let mut s = self.system.clone();
        if !self.host.is_empty() || self.port.is_some() {
            s.push('@');
            s.push_str(&self.host);
        }
        if let Some(port) = self.port {
            s.push(':');
            s.push_str(&port.to_string());
        }
        s
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.authority())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((protocol, rest)) = s.split_once("://") else {
            return Err(AddressParseError::MissingProtocol(s.to_string()));
        };
        if protocol.is_empty() {
            return Err(AddressParseError::MissingProtocol(s.to_string()));
        }

        let (system, host, port) = match rest.split_once('@') {
            Some((system, host_port)) => match host_port.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;
                    (system, host, Some(port))
                }
                None => (system, host_port, None),
            },
            None => {
                if rest.contains(':') {
                    return Err(AddressParseError::PortWithoutHost(s.to_string()));
                }
                (rest, "", None)
            }
        };
        if system.is_empty() {
            return Err(AddressParseError::MissingSystem(s.to_string()));
        }

        Ok(Address::new(protocol, system, host, port))
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_address() {
        let addr: Address = "test://remote-sys@localhost:12346".parse().unwrap();
        assert_eq!(addr.protocol(), "test");
        assert_eq!(addr.system(), "remote-sys");
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), Some(12346));
        assert!(addr.has_global_scope());
    }

    #[test]
    fn dotted_protocols_are_kept_verbatim() {
        let addr: Address = "akka.test://RemotingSpec@localhost:12345".parse().unwrap();
        assert_eq!(addr.protocol(), "akka.test");
        assert_eq!(addr.to_string(), "akka.test://RemotingSpec@localhost:12345");
    }

    #[test]
    fn unbound_address_has_no_port() {
        let addr: Address = "test://sys@host".parse().unwrap();
        assert_eq!(addr.port(), None);
        assert!(!addr.has_global_scope());
        assert_eq!(addr.to_string(), "test://sys@host");
        assert_eq!(addr.with_port(7).to_string(), "test://sys@host:7");
    }

    #[test]
    fn local_only_address_has_no_host() {
        let addr: Address = "test://sys".parse().unwrap();
        assert_eq!(addr.host(), "");
        assert_eq!(addr.to_string(), "test://sys");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            "remote-sys@localhost:1".parse::<Address>(),
            Err(AddressParseError::MissingProtocol(_))
        ));
        assert!(matches!(
            "test://@localhost:1".parse::<Address>(),
            Err(AddressParseError::MissingSystem(_))
        ));
        assert!(matches!(
            "test://sys@localhost:99999".parse::<Address>(),
            Err(AddressParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "test://sys:1".parse::<Address>(),
            Err(AddressParseError::PortWithoutHost(_))
        ));
    }

    #[test]
    fn port_without_host_survives_a_round_trip() {
        let addr = Address::new("test", "sys", "", Some(7));
        assert!(!addr.has_global_scope());
        assert_eq!(addr.to_string(), "test://sys@:7");
        assert_eq!(addr.to_string().parse::<Address>().unwrap(), addr);

        let unbound: Address = "test://sys".parse().unwrap();
        assert_eq!(unbound.with_port(9).to_string(), "test://sys@:9");

        let bytes = rmp_serde::to_vec(&addr).unwrap();
        assert_eq!(rmp_serde::from_slice::<Address>(&bytes).unwrap(), addr);
    }

    #[test]
    fn equality_covers_all_fields() {
        let a = Address::new("test", "sysA", "h", Some(1));
        assert_eq!(a, Address::new("test", "sysA", "h", Some(1)));
        assert_ne!(a, Address::new("tcp", "sysA", "h", Some(1)));
        assert_ne!(a, Address::new("test", "sysB", "h", Some(1)));
        assert_ne!(a, Address::new("test", "sysA", "g", Some(1)));
        assert_ne!(a, Address::new("test", "sysA", "h", None));
    }

    #[test]
    fn serializes_as_canonical_string() {
        let addr = Address::new("test", "sys", "h", Some(2));
        let bytes = rmp_serde::to_vec(&addr).unwrap();
        let decoded: Address = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, addr);
        let as_string: String = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(as_string, "test://sys@h:2");
    }
}

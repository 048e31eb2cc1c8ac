//! Configuration of remoting and its transports.
//!
//! Settings are plain structs with public fields and sensible [`Default`]s, constructed in code by the
//! embedding actor system.
//!
//! ```
//! use std::time::Duration;
//! use kameo_remoting::config::{AdapterKind, RemoteSettings, TransportSettings};
//!
//! let settings = RemoteSettings {
//!     retry_gate_closed_for: Duration::from_millis(500),
//!     transports: vec![TransportSettings {
//!         applied_adapters: vec![AdapterKind::Crc32],
//!         ..TransportSettings::test("test://sys@localhost:12345".parse().unwrap())
//!     }],
//!     ..Default::default()
//! };
//! assert_eq!(settings.associate_timeout, Duration::from_secs(5));
//! ```

use std::{sync::Arc, time::Duration};

use crate::{
    address::Address,
    error::ConfigError,
    transport::{
        adapter::{AdaptedTransport, Crc32Codec, PayloadCodec},
        registry::AssociationRegistry,
        tcp::{TcpTransport, TCP_SCHEME},
        test::{TestTransport, TEST_SCHEME},
        Transport,
    },
};

/// Default largest payload a transport accepts, in bytes.
pub const DEFAULT_MAXIMUM_PAYLOAD_BYTES: usize = 32000;
/// Default number of outbound payloads queued per association.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 256;

/// Settings for [`Remoting`](crate::remoting::Remoting).
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    /// How long associations to an address are refused after a failure.
    pub retry_gate_closed_for: Duration,
    /// Deadline for establishing an association.
    pub associate_timeout: Duration,
    /// Log association lifecycle events at info level instead of debug.
    pub log_remote_lifecycle_events: bool,
    /// The transports to start.
    pub transports: Vec<TransportSettings>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            retry_gate_closed_for: Duration::from_secs(1),
            associate_timeout: Duration::from_secs(5),
            log_remote_lifecycle_events: true,
            transports: Vec::new(),
        }
    }
}

impl RemoteSettings {
    /// Builds every configured transport.
    pub fn build_transports(
        &self,
        registry: &AssociationRegistry,
    ) -> Result<Vec<Arc<dyn Transport>>, ConfigError> {
        self.transports
            .iter()
            .map(|settings| settings.build(registry))
            .collect()
    }
}

/// Which transport implementation to build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// The in-process [`TestTransport`].
    #[default]
    Test,
    /// The network [`TcpTransport`].
    Tcp,
}

/// A payload adapter applied on top of a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// Appends and verifies a CRC32 checksum, see [`Crc32Codec`].
    Crc32,
}

impl AdapterKind {
    fn codec(self) -> Arc<dyn PayloadCodec> {
        match self {
            AdapterKind::Crc32 => Arc::new(Crc32Codec),
        }
    }
}

/// Settings for a single transport.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    /// The implementation to build.
    pub kind: TransportKind,
    /// The protocol scheme; must match the protocol of `local_address`.
    pub scheme_identifier: String,
    /// The address to bind. A missing port is assigned on listen.
    pub local_address: Address,
    /// The largest payload the transport accepts.
    pub maximum_payload_bytes: usize,
    /// The number of outbound payloads queued per association before writes wait.
    pub send_buffer_size: usize,
    /// Adapters wrapped around the transport, innermost first.
    pub applied_adapters: Vec<AdapterKind>,
}

impl TransportSettings {
    /// Settings for a [`TestTransport`] bound to `local_address`.
    pub fn test(local_address: Address) -> Self {
        TransportSettings {
            kind: TransportKind::Test,
            scheme_identifier: TEST_SCHEME.to_string(),
            local_address,
            maximum_payload_bytes: DEFAULT_MAXIMUM_PAYLOAD_BYTES,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            applied_adapters: Vec::new(),
        }
    }

    /// Settings for a [`TcpTransport`] bound to `local_address`.
    pub fn tcp(local_address: Address) -> Self {
        TransportSettings {
            kind: TransportKind::Tcp,
            scheme_identifier: TCP_SCHEME.to_string(),
            ..TransportSettings::test(local_address)
        }
    }

    /// Checks that the settings are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_address.protocol() != self.scheme_identifier {
            return Err(ConfigError::SchemeMismatch {
                scheme: self.scheme_identifier.clone(),
                address: self.local_address.clone(),
            });
        }
        Ok(())
    }

    /// Builds the transport, wrapped in its adapters.
    ///
    /// Test transports are routed through `registry`; other kinds ignore it.
    pub fn build(&self, registry: &AssociationRegistry) -> Result<Arc<dyn Transport>, ConfigError> {
        self.validate()?;
        let base: Arc<dyn Transport> = match self.kind {
            TransportKind::Test => Arc::new(TestTransport::from_settings(self, registry.clone())),
            TransportKind::Tcp => Arc::new(TcpTransport::from_settings(self)),
        };
        Ok(self
            .applied_adapters
            .iter()
            .fold(base, |transport, adapter| {
                Arc::new(AdaptedTransport::new(
                    transport,
                    adapter.codec(),
                    self.send_buffer_size,
                ))
            }))
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings::test(Address::new(TEST_SCHEME, "kameo", "localhost", None))
    }
}

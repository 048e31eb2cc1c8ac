#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod address;
pub mod config;
pub mod deployer;
pub mod error;
pub mod event_stream;
pub mod path;
pub mod provider;
pub mod remoting;
pub mod retry_gate;
pub mod transport;

pub use address::Address;
pub use path::ActorPath;
pub use provider::{ActorRef, RemoteActorRefProvider};
pub use remoting::{LocalDelivery, Remoting};

pub mod bench;
pub mod client;
pub mod config;
pub mod crypto;
pub mod keys;
pub mod model;
pub mod monitor;
pub mod replica;
pub mod task;

pub use anyhow::{anyhow as err, bail, Error, Result};

pub use crate::client::{Client, ClientError, RetryPolicy};
pub use crate::config::{ClusterConfig, ConfigError, Settings};
pub use crate::monitor::Completion;
pub use crate::replica::{ProgressEvent, Replica, ReplicaContext, ReplicaHandle, Supervisor};

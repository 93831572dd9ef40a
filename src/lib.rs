//! An asynchronous network Manager: a TLS message hub brokering
//! JSON-framed remote procedure calls between Clients and named
//! Services over long-lived TCP connections.
//!
//! The Manager authenticates every peer, tracks each peer's declared
//! identity, and routes requests from Clients to the Service owning
//! a named method, routing the Service's reply back to the
//! originating Client. Services may also push notifications to every
//! Client linked with them, and administrators may drive privileged
//! operations over the same wire.

#[cfg(not(feature = "expose_impl"))]
mod hub;

#[cfg(feature = "expose_impl")]
pub mod hub;

pub use crate::hub::client::{connect, Client, ClientConfig, Link, ReplyFuture};
pub use crate::hub::database::{ConnectionsTable, HostnamesTable, UsersTable};
pub use crate::hub::error::{Error, ErrorKind, Result};
pub use crate::hub::manager::{ManagerConfig, ManagerHandle};
pub use crate::hub::service::{
    HandlerResult, Notifier, Service, ServiceBuilder, ServiceConfig, ServiceError, ServiceHandle,
};
pub use crate::hub::{init, InitConfig, InitGuard};

/// Starts a Manager; see [`ManagerConfig`].
pub use crate::hub::manager::run as run_manager;

/// The async runtime helpers, re-exported for demos and embedders.
pub mod rt {
    pub use crate::hub::async_runtime::{block_on, spawn, JoinHandle};
}

/// Builds the positional arguments of a request.
#[macro_export]
macro_rules! args {
    ($($arg:expr),* $(,)?) => {
        vec![$(::serde_json::json!($arg)),*]
    };
}

/// Builds the keyword arguments of a request.
#[macro_export]
macro_rules! kwargs {
    ($($key:ident = $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut map = ::serde_json::Map::new();
        $(map.insert(stringify!($key).to_string(), ::serde_json::json!($value));)*
        map
    }};
}

//! palaver-push library crate.
//!
//! Push notification support for IRC bouncer clients: device registration over
//! the `PALAVER` sub-protocol, recipient matching and HTTP push delivery.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod matcher;
pub mod module;
pub mod notification;
pub mod protocol;
pub mod registry;
pub mod session;

pub use error::{Error, Result};
pub use module::PalaverModule;

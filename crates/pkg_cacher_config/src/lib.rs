//! The pkg-cacher configuration record, its directive-file format, and the
//! hot-reload wrapper around it.

pub mod acl;
pub mod config;
pub mod directive;
pub mod error;
pub mod reload;

pub use acl::AclEntry;
pub use config::{Config, ProxyConfig};
pub use error::{LoadError, ValidationError};
pub use reload::SharedConfig;

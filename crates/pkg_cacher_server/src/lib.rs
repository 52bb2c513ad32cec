#![deny(missing_docs)]

//! The request pipeline (§4.6) and the three ways it is fed a connection
//! (§4.7): a standalone `TcpListener` per bind address, a single inetd-owned
//! stdin/stdout connection, or a CGI invocation driven by environment
//! variables.

pub mod accesslog;
pub mod acl;
pub mod cgi;
pub mod classify;
pub mod error;
pub mod handler;
pub mod inetd;
pub mod listener;

pub use accesslog::AccessLog;
pub use cgi::CgiError;
pub use classify::{classify, Classified, ClassifyError, FileKind};
pub use error::RequestError;
pub use handler::{HandlerContext, Method, ParsedRequest, ResponseStyle, ServedRequest};

//! Request transport between the short-lived shim and the long-running daemon.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use protocol::{socket_path, CniRequest, ErrorPayload, Response, SOCKET_NAME};
pub use server::{filesystem_pre_requirements, Server};

use std::net::SocketAddr;

mod builder;
pub mod capture;
mod handler;
pub mod relay;
#[allow(clippy::module_inception)]
mod server;
pub mod store;

pub use builder::HookServerBuilder;
pub use handler::{HandlerConfig, Handler, HookHandler};
pub use server::{Error, HookServer, HookServerConfig};

/// The server type produced by [`HookServerBuilder::build`].
pub type FsHookServer = HookServer<HookHandler<store::FsRecordStore>>;

/// Connection details attached to every request before it is handled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestMetadata {
    pub remote_addr: SocketAddr,
}

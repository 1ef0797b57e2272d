//! Cache server: snapshot + metadata store and the `/sync/*` HTTP surface (§4.11, §6.1).

pub mod endpoints;
pub mod store;

pub use endpoints::{router, ServerState};
pub use store::FileStore;

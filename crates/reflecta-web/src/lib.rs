//! HTTP transport for the object lifecycle core: one `axum::Router` per
//! process, assembled from a sub-router per registered type plus a top-level
//! CORS/no-store/OPTIONS layer and an auth layer that looks up Basic/Bearer
//! credentials against whichever registered types opted into that role.
//! `reflecta-core` never depends on this crate; this crate only ever talks to
//! it through the public `Pipeline`/`Reader`/`Fanout`/`TypeConfig` API.

mod auth;
mod builder;
mod handlers;
mod response;
mod sse_transport;

pub use auth::{AuthRegistry, BASIC_REALM};
pub use builder::{AppBuilder, MountOptions};
pub use response::error_response;

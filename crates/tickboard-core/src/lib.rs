//! tickboard-core library.
//!
//! Client core of a project tracker: identity resolution, role and group
//! based visibility, prefix-fetch pagination, ticket/board mutations,
//! realtime sync and team chat over pluggable document, identity, blob and
//! push collaborators.

pub mod accounts;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod model;
pub mod mutation;
pub mod notice;
pub mod pagination;
pub mod session;
pub mod store;
pub mod sync;
pub mod visibility;

pub use error::{Error, ErrorCode, Result};

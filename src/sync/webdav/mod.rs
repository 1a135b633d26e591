//! WebDAV transport for sync
//!
//! This module provides:
//! - `WebDAVClient` with PROPFIND/GET/PUT/MKCOL/DELETE and Basic auth
//! - Multistatus parsing that tolerates any namespace prefix
//! - A shared retry policy with exponential backoff

pub mod client;
pub mod propfind;
pub mod retry;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{
    basic_auth_header, join_remote_path, parent_dir, Depth, WebDAVClient, WebDAVConfig,
    WebDAVError,
};
pub use propfind::{parse_multistatus, ResourceInfo};
pub use retry::RetryPolicy;

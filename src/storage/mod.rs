//! Object storage access
//!
//! The upload engine talks to storage only through [`ObjectStore`];
//! [`SwiftClient`] is the production implementation.

pub mod auth;
pub mod swift;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use auth::{Credentials, KeystoneCredentials};
pub use swift::{SwiftClient, SwiftConfig};

/// Storage operations consumed by the upload engine
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create a container; succeeds if it already exists
    async fn create_container(&self, container: &str) -> Result<()>;

    /// Upload one object, returning the ETag reported by storage
    ///
    /// `etag` is the lowercase hex MD5 of `data`; stores that support it
    /// verify the body against it.
    async fn put_object(&self, container: &str, path: &str, data: Bytes, etag: &str)
        -> Result<String>;

    /// Upload a static large object manifest
    async fn put_manifest(&self, container: &str, path: &str, manifest: Bytes) -> Result<String>;
}

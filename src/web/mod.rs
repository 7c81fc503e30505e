//! HTTP surface over the shared catalog.
//!
//! Exposes catalog listing, upload, download and delete as plain JSON/byte
//! request-response operations. Every handler goes through the same
//! [`Catalog`](crate::catalog::Catalog) operations as the TCP sessions, so
//! both surfaces observe one consistent catalog.

pub mod handlers;
pub mod router;

use crate::catalog::Catalog;

/// Maximum request body accepted by `POST /upload`.
pub(crate) const MAX_UPLOAD_SIZE: usize = 256 * 1024 * 1024; // 256 MiB

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
}

//!
//! HTTP edge of the upload client.
//!
//! Everything that talks over the network lives here: the typed client for
//! the conversion backend's multipart REST endpoints, the raw presigned-URL
//! PUT to object storage, and the session-credential capability. The core
//! upload logic consumes these through traits so it can be exercised against
//! in-memory fakes.
//!
#![warn(missing_docs)]

mod config;
mod error;
mod multipart;
mod session;
mod storage;

pub use config::*;
pub use error::*;
pub use multipart::*;
pub use session::*;
pub use storage::*;

//! Domain Layer
//!
//! Value objects and the ports the core depends on.
//!
//! # Usage
//!
//! ```ignore
//! use booru_cdn::domain::{AccessLedger, Fetcher, FetchRequest};
//!
//! async fn touch<L: AccessLedger>(ledger: &L, key: &ResourceKey) -> Result<()> {
//!     ledger.set(&key.to_string(), chrono::Utc::now()).await
//! }
//! ```

pub mod ports;

pub use ports::{
    host_of,
    single_chunk,
    BodyStream,
    // Port traits
    AccessLedger,
    FetchRequest,
    FetchedBody,
    Fetcher,
    // Value objects
    Origin,
    ResourceKey,
};

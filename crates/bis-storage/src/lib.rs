//! Raw page storage, atomic frame files, and HTTP fetching.

mod artifact;
mod csv_io;
mod http;

pub use artifact::{sha256_hex, write_atomic, ArtifactStore, StoredArtifact, WriteMode, WriteOutcome};
pub use csv_io::{frame_from_csv_bytes, frame_to_csv_bytes, read_frame_csv, write_frame_csv};
pub use http::{
    is_transient_error, is_transient_status, FetchError, HttpClientConfig, HttpFetcher, PageResponse,
    RateLimit, RetryPolicy,
};

pub const CRATE_NAME: &str = "bis-storage";

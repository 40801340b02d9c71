//! Download engine for a share-a-link media client.
//!
//! A URL goes to a remote processing service, which answers with one file, a
//! list of files, or a rejection. Each resulting file is streamed to local
//! storage, split into concurrent range requests when the server allows it.
//! A local history keeps the same content from being fetched twice.
//!
//! [`DownloadCoordinator`] is the entry point; progress is published as
//! [`ProgressEvent`]s on a broadcast channel.

pub mod api;
pub mod backoff;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hashing;
pub mod history;
pub mod orchestrator;
pub mod progress;
pub mod transfer;
pub mod utils;

pub use api::{ProcessingClient, ProcessingResponse, ServerInfo};
pub use backoff::{BackoffConfig, BackoffPolicy};
pub use config::Config;
pub use coordinator::{BatchItemResult, DownloadCoordinator, DownloadHandle};
pub use error::{DownloadError, DownloadResult, ErrorClass};
pub use history::{HistoryRecord, HistoryStore, MatchStrategy};
pub use orchestrator::{RequestOrchestrator, RequestOutcome, SavedFile};
pub use progress::{DownloadRequest, EventSink, ProgressEvent, RequestId};
pub use transfer::{TransferEngine, TransferOutcome, TransferSettings};

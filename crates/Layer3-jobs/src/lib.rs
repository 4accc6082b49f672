//! # relay-jobs
//!
//! Offloaded execution for Relay:
//! - Envelope encryption of payloads (`crypto`)
//! - Blob storage and the per-task metadata layout (`store`, `metadata`)
//! - Remote job triggers and outcome callbacks (`trigger`, `callback`)
//! - The orchestrator's poll-and-stream loop (`orchestrator`, `poller`)
//! - Inline execution and the job worker that hosts it remotely (`inline`, `worker`)

pub mod callback;
pub mod crypto;
pub mod inline;
pub mod metadata;
pub mod orchestrator;
pub mod poller;
pub mod store;
pub mod trigger;
pub mod worker;

pub use callback::{CallbackNotifier, HttpCallback};
pub use crypto::{EncryptedPayload, EnvelopeCipher, KeyManager, LocalKeyManager, ENVELOPE_VERSION};
pub use inline::InlineExecutor;
pub use metadata::{paths, MetadataStore, TaskMetadata};
pub use orchestrator::{Ack, JobOrchestrator, OrchestratorSettings};
pub use poller::{LogPoller, PollBatch};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use trigger::{JobTrigger, ProcessTrigger, RemoteStop};
pub use worker::{JobWorker, SegmentSink, WorkerSettings};

//! blobrelay-core: transactional streaming transfer engine
//!
//! Moves large binary payloads between a byte stream and a transactional
//! large-object store (or the filesystem) with flow control, exactly-once
//! transaction resolution, and a registry for handing inbound streams from
//! one unit of work to another.

pub mod config;
pub mod error;
pub mod files;
pub mod guard;
pub mod handle;
pub mod memory;
pub mod pump;
pub mod registry;
pub mod store;
pub mod transfer;

pub use config::{ConfigIdentity, RelayConfig, StoreSection};
pub use error::{Outcome, Result, TransferError};
pub use files::{start_file_download, upload_file, StoredFile};
pub use guard::{Decision, Resolution, TransactionGuard, TransferState};
pub use handle::{LargeObjectHandle, LargeObjectSink};
pub use memory::{MemoryStats, MemoryStore};
pub use pump::{byte_channel, pump, reader_stream, ByteStream, ChunkSink, PumpError, WriterSink, DEFAULT_CHUNK_SIZE};
pub use registry::{InboundStream, RegistryConfig, StreamId, StreamMetadata, StreamRegistry};
pub use store::{AccessMode, LargeObjectTransaction, LoFd, Oid, TransactionSource};
pub use transfer::{content_disposition, start_download, upload, Download, DownloadHeaders, TransferConfig, UploadReceipt};

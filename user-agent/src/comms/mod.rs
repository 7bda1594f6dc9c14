//! Kernel side of the agent: the minifilter port, the buffer pool its frames
//! are read into, and the receiver/worker threads that turn frames into
//! normalized events.

pub mod ingest;
pub mod pool;
pub mod port;

pub use ingest::{EventSink, IngestOptions, Ingestion, process_frame};
pub use pool::{BufferPool, PooledBuffer};
pub use port::{MessagePort, PortError};

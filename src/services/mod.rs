pub mod cache;
pub mod cancellation;
pub mod downloader;
pub mod enrichment;
pub mod exporter;
pub mod extractor;
pub mod idempotency;
pub mod limiter;
pub mod orchestrator;
pub mod pipeline;
pub mod quota;
pub mod refine;
pub mod staging;
pub mod workers_ai;

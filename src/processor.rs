//! Processing pipeline covering the reader loop, retry backoff, worker pool
//! coordination, gap-aware commit tracking, and run orchestration.

pub mod backoff;
pub mod commit;
pub mod orchestrator;
pub mod reader;
pub mod worker;
pub mod worker_pool;

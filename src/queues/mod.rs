//! Work queues for running OCR with bounded concurrency.

pub mod ocr;
pub mod work;

//! The synchronization engine: remote indexing with pruning, thumbnail
//! backfill, local change detection, the durable upload queue, and the
//! orchestrator that derives one coherent status from all of it.

pub mod backoff;
pub mod catalog;
pub mod detector;
pub mod indexer;
pub mod local_media;
pub mod orchestrator;
pub mod paths;
pub mod thumbs;
pub mod uploader;

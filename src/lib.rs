#![deny(missing_docs)]

//! Core library for the docmill ingestion worker.
//!
//! docmill consumes document-processing tasks from a shared queue, turns raw
//! documents into vectorized content chunks, optionally builds a recursive
//! summary tree over them, and commits the result into a per-tenant search
//! index. Workers are horizontally scalable: many processes share one queue
//! consumer group and each claims a single task at a time.

/// Blob storage HTTP client.
pub mod blob;
/// Parser registry and chunker capabilities.
pub mod chunking;
/// Environment-driven configuration management.
pub mod config;
/// Embedding and chat model capabilities and provider adapters.
pub mod llm;
/// Structured logging and tracing setup.
pub mod logging;
/// Task partitioning for newly ingested documents.
pub mod partition;
/// Chunk build, embedding, RAPTOR, and index-commit stages.
pub mod pipeline;
/// Redis Streams task queue integration.
pub mod queue;
/// Search index service client.
pub mod search;
/// Metadata store capability and HTTP adapter.
pub mod store;
/// Retrieval tokenization helpers.
pub mod tokenize;
/// Queue consumer loop and heartbeat.
pub mod worker;

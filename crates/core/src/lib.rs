//! Core library: ingestion, chunking, embeddings, vector index, retrieval, answers.

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod rag;
pub mod retriever;
pub mod vectorstore;

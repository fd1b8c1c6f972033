#![allow(clippy::missing_docs_in_private_items)]

pub mod driver;
pub mod notify;
pub mod pipeline;
pub mod portal;
pub mod uploader;

pub use pipeline::{RetrievalRequest, ScrapeOrchestrator};

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Archivist: Local AI Drop-Folder Organizer
//!
//! Watches a drop folder, classifies incoming files and folders with a local
//! summarization model, files them into a curated archive hierarchy, and keeps
//! a semantic index eventually consistent with whatever happens to that
//! archive on disk.

pub mod archive;
pub mod config;
pub mod error;
pub mod extract;
pub mod history;
pub mod index;
pub mod ingest;
pub mod maintain;
pub mod ollama;
pub mod placement;
pub mod reconcile;
pub mod search;
pub mod service;
pub mod summarizer;
pub mod watcher;
pub mod web;

pub use config::AppConfig;
pub use error::{ArchivistError, Result};
pub use service::ArchiveService;

//! Discourse thread archiver library.
//!
//! Archives one forum thread at a time into a self-contained directory:
//! thread metadata, every post, and the media those posts embed, with
//! optional pseudonymization of authors. Progress and throttling are
//! reported as a stream of [`events::ArchiveEvent`]s.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod archiver;
pub mod bundle;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod fs_utils;
pub mod resources;
pub mod thread;

pub use archiver::{sanitize, ArchiveSummary, Archiver};
pub use bundle::{classify_directory, DirectoryState, WriteMode};
pub use error::{ArchiveError, ErrorKind};
pub use events::{ArchiveEvent, EventReporter};
pub use thread::{parse_thread_ref, ThreadMeta};

//! # par-zip: Multi-Threaded ZIP/TAR Archive Engine
//!
//! `par-zip` creates, reads, mutates, and extracts PKZIP archives with
//! throughput on large directory trees as the design goal: files are
//! split into fixed-size blocks, the blocks are compressed in parallel by
//! a worker pool under a hard memory cap, and the per-block outputs are
//! stitched back into a single DEFLATE stream per file using CRC-32
//! combination. Extraction runs the same way in reverse, with one archive
//! handle per worker. A TAR writer/reader (PAX + GNU long names) shares
//! the traversal contract.
//!
//! ## Features
//!
//! - **Block-parallel compression**: 8 MiB blocks, bounded 128 MiB of
//!   in-flight data, any thread count
//! - **Parallel extraction**: per-worker archive handles, mtime restore
//! - **AES-256 entry encryption** (WinZip AE-2)
//! - **Archive mutation**: bulk rename, move, and recursive delete
//! - **Async tasks**: progress, cooperative cancellation, and a pollable
//!   event queue for embedding hosts
//!
//! ## Quick Start
//!
//! ### Compressing a directory
//!
//! ```no_run
//! use par_zip::{Archive, OpenMode, TaskState, ZipDirsOptions};
//!
//! let archive = Archive::open("out.zip", OpenMode::Create, None)?;
//! let task = TaskState::new();
//! par_zip::zip_dirs(
//!     &task,
//!     archive,
//!     &["some/dir".into()],
//!     &ZipDirsOptions::default(),
//! )?;
//! # Ok::<(), par_zip::ZipError>(())
//! ```
//!
//! ### Extracting everything
//!
//! ```no_run
//! use par_zip::{Archive, OpenMode, TaskState};
//!
//! let mut archive = Archive::open("out.zip", OpenMode::ReadOnly, None)?;
//! let task = TaskState::new();
//! par_zip::unzip_to_dir(&task, &mut archive, &[String::new()], "dest".as_ref(), 4)?;
//! # Ok::<(), par_zip::ZipError>(())
//! ```

pub mod archive;
pub mod codec;
pub mod compress;
pub mod counter;
pub mod encryption;
pub mod error;
pub mod extract;
pub mod mq;
pub mod mutate;
pub mod paths;
pub mod pool;
pub mod tar;
pub mod task;
pub mod walk;

pub use archive::{Archive, EntryReader, EntrySource, EntryStat, OpenMode, SourceStat};
pub use compress::{zip_dirs, ZipDirsOptions};
pub use counter::BoundedCounter;
pub use error::{ErrorCode, Result, ZipError};
pub use extract::unzip_to_dir;
pub use mq::MessageQueue;
pub use mutate::{move_entries, remove_entries, rename_entry};
pub use pool::{JobPool, SimplePool};
pub use tar::{tar_dir, untar_to_dir, TarWriter};
pub use task::{
    move_entries_async, poll_event, remove_entries_async, rename_entry_async, unzip_to_dir_async,
    zip_dirs_async, NotifyAction, NotifyMessage, Progress, TaskState, MIN_TASK_ID,
};

//! Parallel ZIP extraction engine.
//!
//! Phase 1 (single thread): expand the requested entries into a job queue
//! of entry indices. A requested directory (trailing `/`, or the empty
//! string for the whole archive) pulls in every entry under its prefix.
//!
//! Phase 2: `threads - 1` pool workers plus the calling thread drain the
//! queue. Every pool worker opens its own read-only handle against the
//! archive path; the container's read state is not shareable across
//! threads. Output files are streamed in 16 KiB chunks, with a mkdir-retry
//! when an entry's parent directories have no entries of their own.
//!
//! Phase 3 (single thread, skipped on cancellation): directory mtimes are
//! restored after every file exists, so writing files cannot re-bump them.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;

use crate::archive::{check_entry_name, Archive, OpenMode};
use crate::error::{Result, ZipError};
use crate::mq::MessageQueue;
use crate::paths;
use crate::pool::SimplePool;
use crate::task::TaskState;

const IO_CHUNK: usize = 16 * 1024;

struct ExtractJob {
    index: usize,
    /// Bytes of the entry name to strip before joining onto `dest_dir`.
    base_path_len: usize,
}

struct ExtractShared {
    task: Arc<TaskState>,
    jobs: MessageQueue<ExtractJob>,
    dest_dir: PathBuf,
    archive_path: PathBuf,
    password: Option<String>,
}

fn set_mtime(path: &Path, mtime: i64) {
    let _ = filetime::set_file_mtime(path, FileTime::from_unix_time(mtime, 0));
}

fn extract_entry(shared: &ExtractShared, archive: &mut Archive, job: &ExtractJob) -> Result<()> {
    let stat = archive.stat_at(job.index)?;
    check_entry_name(&stat.name)?;

    let rel = &stat.name[job.base_path_len.min(stat.name.len())..];
    let out_path = paths::join_entry_path(&shared.dest_dir, rel);
    shared
        .task
        .set_current_file(&out_path.display().to_string());

    if stat.is_dir() {
        fs::create_dir_all(&out_path)
            .map_err(|_| ZipError::Mkdir(out_path.display().to_string()))?;
        return Ok(());
    }

    if shared.task.is_cancelled() {
        return Ok(());
    }

    let mut reader = archive.open_entry_stream(job.index)?;
    let mut out = match File::create(&out_path) {
        Ok(f) => f,
        Err(_) => {
            // entries like "a/b/c.txt" may arrive without "a/" or "a/b/"
            // directory entries of their own
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|_| ZipError::Mkdir(parent.display().to_string()))?;
            }
            File::create(&out_path)?
        }
    };

    let mut buf = [0u8; IO_CHUNK];
    let mut written: u64 = 0;
    while written < stat.size {
        if shared.task.is_cancelled() {
            break;
        }
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    drop(reader);
    drop(out);

    set_mtime(&out_path, stat.mtime);

    shared.task.add_processed(stat.size, stat.comp_size);
    shared.task.set_current_file("");
    Ok(())
}

/// Drain the job queue with the given handle; the first failure cancels
/// the task and stops every consumer.
fn consume_queue(shared: &ExtractShared, archive: &mut Archive) {
    while let Some(job) = shared.jobs.pop() {
        if shared.task.is_cancelled() {
            return;
        }
        if let Err(e) = extract_entry(shared, archive, &job) {
            shared.task.fail(e);
            return;
        }
    }
}

fn worker_thread(shared: &ExtractShared) {
    let mut archive = match Archive::open(
        &shared.archive_path,
        OpenMode::ReadOnly,
        shared.password.as_deref(),
    ) {
        Ok(a) => a,
        Err(e) => {
            shared.task.fail(e);
            return;
        }
    };
    consume_queue(shared, &mut archive);
}

/// Collect the jobs for one requested entry path.
fn queue_entry_jobs(
    task: &Arc<TaskState>,
    archive: &Archive,
    entry_path: &str,
    jobs: &MessageQueue<ExtractJob>,
) -> Result<()> {
    if paths::is_dir_entry(entry_path) {
        // directory request: everything under the prefix
        let base_path_len = entry_path.len();
        let mut found = false;
        for index in 0..archive.num_entries() {
            let stat = archive.stat_at(index)?;
            if !stat.name.starts_with(entry_path) {
                continue;
            }
            check_entry_name(&stat.name)?;
            task.add_total(stat.size);
            let _ = jobs.push(ExtractJob {
                index,
                base_path_len,
            });
            found = true;
        }
        if !found {
            return Err(ZipError::EntryNotFound(entry_path.to_string()));
        }
    } else {
        let index = archive
            .locate(entry_path)
            .ok_or_else(|| ZipError::EntryNotFound(entry_path.to_string()))?;
        let stat = archive.stat_at(index)?;
        check_entry_name(&stat.name)?;
        task.add_total(stat.size);
        let _ = jobs.push(ExtractJob {
            index,
            base_path_len: paths::parent_prefix_len(entry_path),
        });
    }
    Ok(())
}

/// Restore directory mtimes from their archive entries.
fn restore_dir_mtimes(archive: &Archive, dest_dir: &Path) {
    for index in 0..archive.num_entries() {
        let Ok(stat) = archive.stat_at(index) else {
            continue;
        };
        if !stat.is_dir() || paths::is_malicious_path(&stat.name) {
            continue;
        }
        let dir_path = paths::join_entry_path(dest_dir, &stat.name);
        set_mtime(&dir_path, stat.mtime);
    }
}

/// Extract the requested entries into `dest_dir` with `threads` consumers.
///
/// `entries` may mix files and directory prefixes; an empty string selects
/// the whole archive. The calling thread participates in the drain, so
/// effective parallelism equals `threads`.
pub fn unzip_to_dir(
    task: &Arc<TaskState>,
    archive: &mut Archive,
    entries: &[String],
    dest_dir: &Path,
    threads: usize,
) -> Result<()> {
    if entries.is_empty() {
        return Err(ZipError::InvalidArgument("no entries requested"));
    }
    let threads = threads.max(1);

    let shared = Arc::new(ExtractShared {
        task: Arc::clone(task),
        jobs: MessageQueue::new(),
        dest_dir: dest_dir.to_path_buf(),
        archive_path: archive.path().to_path_buf(),
        password: archive.password().map(str::to_string),
    });

    for entry_path in entries {
        queue_entry_jobs(task, archive, entry_path, &shared.jobs)?;
    }
    shared.jobs.close();

    let pool = {
        let shared = Arc::clone(&shared);
        SimplePool::new(threads - 1, move || worker_thread(&shared))
    };
    consume_queue(&shared, archive);
    pool.join();

    if let Some(err) = task.take_error() {
        return Err(err);
    }
    if task.is_cancelled() {
        return Err(ZipError::Cancelled);
    }

    restore_dir_mtimes(archive, dest_dir);
    Ok(())
}

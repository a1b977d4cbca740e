//! Task lifecycle, progress, and the host event surface.
//!
//! Every asynchronous operation gets a monotonic task ID and a shared
//! [`TaskState`] carrying the cancellation flag, the first error, and a
//! progress snapshot. A detached worker thread runs the operation and
//! delivers exactly one terminal event (`Finish` or `Error`) through the
//! process-wide event queue; `Warning` and `Log` events may precede it.
//! [`poll_event`] waits at most one second so a polling host is never
//! parked indefinitely.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::archive::Archive;
use crate::compress::{self, ZipDirsOptions};
use crate::error::{Result, ZipError};
use crate::extract;
use crate::mq::MessageQueue;
use crate::mutate;

/// First task ID ever issued.
pub const MIN_TASK_ID: i32 = 888;

static NEXT_TASK_ID: AtomicI32 = AtomicI32::new(MIN_TASK_ID);

fn generate_task_id() -> i32 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// event sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    Finish,
    Warning,
    Error,
    Log,
}

#[derive(Debug, Clone)]
pub struct NotifyMessage {
    pub task_id: i32,
    pub action: NotifyAction,
    pub err_code: i32,
    pub err_msg: Option<String>,
}

fn event_queue() -> &'static MessageQueue<NotifyMessage> {
    static QUEUE: OnceLock<MessageQueue<NotifyMessage>> = OnceLock::new();
    QUEUE.get_or_init(MessageQueue::new)
}

/// Wait up to one second for the next event.
pub fn poll_event() -> Option<NotifyMessage> {
    event_queue().pop_timeout(Duration::from_secs(1))
}

fn notify(task_id: i32, action: NotifyAction, err_code: i32, err_msg: Option<String>) {
    let _ = event_queue().push(NotifyMessage {
        task_id,
        action,
        err_code,
        err_msg,
    });
}

pub(crate) fn notify_finish(task_id: i32) {
    notify(task_id, NotifyAction::Finish, 0, None);
}

pub(crate) fn notify_error(task_id: i32, err: &ZipError) {
    notify(task_id, NotifyAction::Error, err.code(), Some(err.to_string()));
}

pub(crate) fn notify_log(msg: &str) {
    notify(-1, NotifyAction::Log, 0, Some(msg.to_string()));
}

// ---------------------------------------------------------------------------
// task state
// ---------------------------------------------------------------------------

/// Progress snapshot of a running task.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub current_file_path: String,
    pub total_file_size: u64,
    pub processed_file_size: u64,
    pub processed_compress_size: u64,
}

/// Shared state of one compress/extract/mutation task.
pub struct TaskState {
    id: i32,
    cancelled: AtomicBool,
    done: AtomicBool,
    error: Mutex<Option<ZipError>>,
    progress: Mutex<Progress>,
}

impl TaskState {
    pub fn new() -> Arc<TaskState> {
        Arc::new(TaskState {
            id: generate_task_id(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            error: Mutex::new(None),
            progress: Mutex::new(Progress::default()),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Request cooperative cancellation. Workers observe the flag at every
    /// blocking wait and loop iteration.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Relaxed);
    }

    /// Record the first error and flip the cancellation flag; later calls
    /// keep the original error.
    pub(crate) fn fail(&self, err: ZipError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.cancel();
    }

    pub(crate) fn take_error(&self) -> Option<ZipError> {
        self.error.lock().unwrap().take()
    }

    /// Clone of the current progress; the string is copied so the caller
    /// never observes a path mid-update.
    pub fn progress(&self) -> Progress {
        self.progress.lock().unwrap().clone()
    }

    pub(crate) fn set_current_file(&self, path: &str) {
        let mut p = self.progress.lock().unwrap();
        p.current_file_path.clear();
        p.current_file_path.push_str(path);
    }

    pub(crate) fn add_total(&self, bytes: u64) {
        self.progress.lock().unwrap().total_file_size += bytes;
    }

    pub(crate) fn add_processed(&self, file_bytes: u64, comp_bytes: u64) {
        let mut p = self.progress.lock().unwrap();
        p.processed_file_size += file_bytes;
        p.processed_compress_size += comp_bytes;
    }

    pub(crate) fn warn_log(&self, msg: &str) {
        notify_log(&format!("task {}: {}", self.id, msg));
    }
}

// ---------------------------------------------------------------------------
// async operations
// ---------------------------------------------------------------------------

fn run_detached<F>(task: &Arc<TaskState>, body: F)
where
    F: FnOnce(&Arc<TaskState>) -> Result<()> + Send + 'static,
{
    let task = Arc::clone(task);
    thread::spawn(move || {
        let result = body(&task);
        task.set_current_file("");
        task.mark_done();
        match result {
            Ok(()) => notify_finish(task.id()),
            Err(e) => notify_error(task.id(), &e),
        }
    });
}

/// Compress directories into `archive` on a detached worker thread.
/// The archive is committed (or discarded on failure) by the task itself.
pub fn zip_dirs_async(
    archive: Archive,
    roots: Vec<PathBuf>,
    opts: ZipDirsOptions,
) -> Arc<TaskState> {
    let task = TaskState::new();
    run_detached(&task, move |task| compress::zip_dirs(task, archive, &roots, &opts));
    task
}

/// Extract entries to `dest_dir` on a detached worker thread.
/// The archive is only read; it is not committed.
pub fn unzip_to_dir_async(
    mut archive: Archive,
    entries: Vec<String>,
    dest_dir: PathBuf,
    threads: usize,
) -> Arc<TaskState> {
    let task = TaskState::new();
    run_detached(&task, move |task| {
        extract::unzip_to_dir(task, &mut archive, &entries, &dest_dir, threads)
    });
    task
}

fn run_mutation<F>(mut archive: Archive, body: F) -> i32
where
    F: FnOnce(&mut Archive) -> Result<()> + Send + 'static,
{
    let task = TaskState::new();
    let id = task.id();
    run_detached(&task, move |_| {
        let result = body(&mut archive).and_then(|()| archive.close());
        if result.is_err() {
            archive.discard();
        }
        result
    });
    id
}

/// Rename one entry (or a directory prefix) and commit. Returns the task
/// ID; the outcome arrives through the event queue.
pub fn rename_entry_async(archive: Archive, entry_path: String, new_entry_path: String) -> i32 {
    run_mutation(archive, move |zip| {
        mutate::rename_entry(zip, &entry_path, &new_entry_path)
    })
}

/// Move entries under a new base directory and commit.
pub fn move_entries_async(archive: Archive, entry_paths: Vec<String>, new_base: String) -> i32 {
    run_mutation(archive, move |zip| {
        mutate::move_entries(zip, &entry_paths, &new_base)
    })
}

/// Delete entries (directory prefixes recurse) and commit.
pub fn remove_entries_async(archive: Archive, entry_paths: Vec<String>) -> i32 {
    run_mutation(archive, move |zip| mutate::remove_entries(zip, &entry_paths))
}

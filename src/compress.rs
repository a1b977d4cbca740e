//! Parallel ZIP compression engine.
//!
//! Files are split into fixed-size blocks. A traversal thread chains the
//! blocks per file, queues them, and registers one pull source per file
//! with the container. A pool of workers drains the queue, compressing
//! each block through a fresh raw-deflate stream (interior blocks end with
//! a sync flush, the file's last block with a finish), and records the
//! block's CRC over the uncompressed bytes. When the container commits, it
//! drains each file's source, which stitches the block outputs back into
//! one DEFLATE stream in file order and folds the per-block CRCs together.
//!
//! Admission control: a bounded counter caps the aggregate uncompressed
//! bytes held by in-flight blocks (128 MiB by default). A second counter
//! tracks live compressed buffers; both must read zero when the task ends.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::archive::{Archive, EmptySource, EntrySource, SourceStat, METHOD_DEFLATE};
use crate::codec::{crc32_combine, deflate_bound, BlockCompressor, Flush};
use crate::counter::BoundedCounter;
use crate::error::{Result, ZipError};
use crate::mq::MessageQueue;
use crate::paths;
use crate::pool::SimplePool;
use crate::task::TaskState;
use crate::walk::{walk_dir, WalkStat};

/// Default uncompressed block size.
pub const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
/// Default cap on uncompressed bytes held by in-flight blocks.
pub const DEFAULT_MAX_MEMORY: u64 = 128 * 1024 * 1024;

const IO_CHUNK: usize = 16 * 1024;
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Options for [`zip_dirs`].
#[derive(Debug, Clone)]
pub struct ZipDirsOptions {
    /// DEFLATE level, 0-9.
    pub compress_level: u32,
    /// Prefix for every archive entry: empty, or a path ending with `/`
    /// and not starting with `/`.
    pub entry_base: String,
    /// Promote each root's children to the top of the archive instead of
    /// the root directory itself.
    pub skip_top_level: bool,
    pub threads: usize,
    /// Encrypt every added entry with the archive's default password.
    pub encrypt: bool,
    pub max_block_size: u64,
    pub max_memory: u64,
}

impl Default for ZipDirsOptions {
    fn default() -> Self {
        ZipDirsOptions {
            compress_level: 5,
            entry_base: String::new(),
            skip_top_level: false,
            threads: num_cpus::get().max(1),
            encrypt: false,
            max_block_size: DEFAULT_BLOCK_SIZE,
            max_memory: DEFAULT_MAX_MEMORY,
        }
    }
}

// ---------------------------------------------------------------------------
// blocks
// ---------------------------------------------------------------------------

struct BlockSlot {
    /// Compression finished and `data`/`crc` are valid.
    done: bool,
    /// The block passed admission control (its size is counted in the
    /// memory gate).
    admitted: bool,
    /// The source consumed and released this block.
    consumed: bool,
    crc: u32,
    data: Option<Vec<u8>>,
}

struct Block {
    path: Arc<PathBuf>,
    offset: u64,
    size: u64,
    /// Last block of its file: sealed with `Flush::Finish`.
    last: bool,
    slot: Mutex<BlockSlot>,
    done_cv: Condvar,
}

impl Block {
    fn new(path: Arc<PathBuf>, offset: u64, size: u64, last: bool) -> Arc<Block> {
        Arc::new(Block {
            path,
            offset,
            size,
            last,
            slot: Mutex::new(BlockSlot {
                done: false,
                admitted: false,
                consumed: false,
                crc: 0,
                data: None,
            }),
            done_cv: Condvar::new(),
        })
    }
}

struct CompressShared {
    task: Arc<TaskState>,
    blocks: MessageQueue<Arc<Block>>,
    /// Uncompressed bytes admitted into the pipeline.
    memory_gate: BoundedCounter,
    /// Live compressed buffers.
    allocated_blocks: BoundedCounter,
    level: u32,
}

// ---------------------------------------------------------------------------
// worker side
// ---------------------------------------------------------------------------

fn compress_block(shared: &CompressShared, block: &Block) -> Result<()> {
    let mut file = File::open(block.path.as_ref())?;
    file.seek(SeekFrom::Start(block.offset))?;

    let mut compressor = BlockCompressor::new(shared.level);
    let mut out = Vec::with_capacity(deflate_bound(block.size));
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = [0u8; IO_CHUNK];
    let mut read_total: u64 = 0;

    while read_total < block.size {
        if shared.task.is_cancelled() {
            return Err(ZipError::Cancelled);
        }
        let want = (IO_CHUNK as u64).min(block.size - read_total) as usize;
        file.read_exact(&mut buf[..want])?;
        read_total += want as u64;
        hasher.update(&buf[..want]);

        let flush = if read_total == block.size {
            if block.last {
                Flush::Finish
            } else {
                Flush::Block
            }
        } else {
            Flush::None
        };
        compressor.compress(&buf[..want], &mut out, flush)?;
    }

    let mut s = block.slot.lock().unwrap();
    s.crc = hasher.finalize();
    s.data = Some(out);
    s.done = true;
    shared.allocated_blocks.add(1);
    block.done_cv.notify_all();
    Ok(())
}

fn worker_loop(shared: &CompressShared) {
    loop {
        if shared.task.is_cancelled() {
            return;
        }
        let Some(block) = shared.blocks.pop() else {
            return; // queue closed and drained
        };

        // admission: may block until the pipeline drains below the cap
        shared.memory_gate.add(block.size);
        block.slot.lock().unwrap().admitted = true;

        if shared.task.is_cancelled() {
            return;
        }
        if let Err(e) = compress_block(shared, &block) {
            shared.task.fail(e);
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// source side (runs on the container's commit thread)
// ---------------------------------------------------------------------------

/// Streams a file's compressed blocks, in order, as one DEFLATE payload.
struct BlockSource {
    shared: Arc<CompressShared>,
    file_path: String,
    mtime: i64,
    file_size: u64,
    blocks: VecDeque<Arc<Block>>,
    /// Read position inside the current block's compressed buffer.
    buf_offset: usize,
    compressed_total: u64,
    running_crc: u32,
    eof: bool,
}

impl BlockSource {
    /// Wait until a block finishes compressing, observing cancellation.
    fn wait_done(&self, block: &Block) -> Result<()> {
        let mut s = block.slot.lock().unwrap();
        loop {
            if self.shared.task.is_cancelled() {
                return Err(ZipError::Cancelled);
            }
            if s.done {
                return Ok(());
            }
            let (guard, _) = block.done_cv.wait_timeout(s, CANCEL_POLL).unwrap();
            s = guard;
        }
    }

    /// Release the fully-drained front block and account for it.
    fn consume_front(&mut self) {
        let Some(block) = self.blocks.pop_front() else {
            return;
        };
        let mut drained = 0u64;
        {
            let mut s = block.slot.lock().unwrap();
            if let Some(data) = s.data.take() {
                drained = data.len() as u64;
                self.shared.allocated_blocks.sub(1);
            }
            if s.admitted && !s.consumed {
                self.shared.memory_gate.sub(block.size);
            }
            s.consumed = true;
        }
        self.shared.task.add_processed(block.size, drained);
    }
}

impl EntrySource for BlockSource {
    fn open(&mut self) -> Result<()> {
        if self.shared.task.is_cancelled() {
            return Err(ZipError::Cancelled);
        }
        let first = match self.blocks.front() {
            Some(b) => Arc::clone(b),
            None => {
                self.eof = true;
                return Ok(());
            }
        };
        self.wait_done(&first)?;
        self.shared.task.set_current_file(&self.file_path);
        self.running_crc = first.slot.lock().unwrap().crc;
        self.buf_offset = 0;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut written = 0usize;
        while written < buf.len() {
            if self.shared.task.is_cancelled() {
                return Err(ZipError::Cancelled);
            }
            let Some(block) = self.blocks.front().map(Arc::clone) else {
                self.eof = true;
                break;
            };

            let exhausted = {
                let s = block.slot.lock().unwrap();
                let data = s
                    .data
                    .as_ref()
                    .ok_or_else(|| ZipError::Internal("block drained twice".into()))?;
                let n = (data.len() - self.buf_offset).min(buf.len() - written);
                buf[written..written + n]
                    .copy_from_slice(&data[self.buf_offset..self.buf_offset + n]);
                self.buf_offset += n;
                written += n;
                self.buf_offset == data.len()
            };

            if exhausted {
                // block fully drained: release it and move to the next
                self.consume_front();
                self.buf_offset = 0;
                match self.blocks.front().map(Arc::clone) {
                    None => {
                        self.eof = true;
                        break;
                    }
                    Some(next) => {
                        self.wait_done(&next)?;
                        let crc = next.slot.lock().unwrap().crc;
                        self.running_crc = crc32_combine(self.running_crc, crc, next.size);
                    }
                }
            }
        }
        self.compressed_total += written as u64;
        Ok(written)
    }

    fn stat(&self) -> SourceStat {
        SourceStat {
            size: self.file_size,
            comp_size: self.compressed_total,
            crc32: self.running_crc,
            method: METHOD_DEFLATE,
            mtime: self.mtime,
        }
    }
}

impl Drop for BlockSource {
    fn drop(&mut self) {
        // release whatever the container never consumed (cancellation path)
        while let Some(block) = self.blocks.pop_front() {
            let mut s = block.slot.lock().unwrap();
            if s.consumed {
                continue;
            }
            if s.data.take().is_some() {
                self.shared.allocated_blocks.sub(1);
            }
            if s.admitted {
                self.shared.memory_gate.sub(block.size);
            }
            s.consumed = true;
        }
        self.shared.task.set_current_file("");
    }
}

// ---------------------------------------------------------------------------
// engine entry point
// ---------------------------------------------------------------------------

fn validate_options(roots: &[PathBuf], opts: &ZipDirsOptions) -> Result<()> {
    if roots.is_empty() {
        return Err(ZipError::InvalidArgument("no input paths"));
    }
    if opts.threads < 1 {
        return Err(ZipError::InvalidArgument("thread count must be at least 1"));
    }
    if opts.max_block_size == 0 || opts.max_memory < opts.max_block_size {
        return Err(ZipError::InvalidArgument(
            "memory limit must hold at least one block",
        ));
    }
    let base = &opts.entry_base;
    if paths::is_malicious_path(base) {
        return Err(ZipError::InvalidPath(base.clone()));
    }
    if !base.is_empty() && (base.starts_with('/') || !base.ends_with('/')) {
        return Err(ZipError::InvalidPath(base.clone()));
    }
    for root in roots {
        let s = root.to_string_lossy();
        if s.is_empty() || s.ends_with(std::path::MAIN_SEPARATOR) {
            return Err(ZipError::InvalidPath(s.into_owned()));
        }
    }
    Ok(())
}

fn register_file(
    archive: &mut Archive,
    shared: &Arc<CompressShared>,
    abs: &Path,
    rel: &str,
    stat: &WalkStat,
    opts: &ZipDirsOptions,
) -> Result<()> {
    let source: Box<dyn EntrySource> = if stat.size == 0 {
        Box::new(EmptySource::new(stat.mtime))
    } else {
        let path = Arc::new(abs.to_path_buf());
        let mut blocks = VecDeque::new();
        let mut offset = 0u64;
        while offset < stat.size {
            let size = opts.max_block_size.min(stat.size - offset);
            let block = Block::new(Arc::clone(&path), offset, size, offset + size == stat.size);
            shared
                .blocks
                .push(Arc::clone(&block))
                .map_err(|_| ZipError::Internal("block queue closed during traversal".into()))?;
            blocks.push_back(block);
            offset += size;
        }
        Box::new(BlockSource {
            shared: Arc::clone(shared),
            file_path: abs.display().to_string(),
            mtime: stat.mtime,
            file_size: stat.size,
            blocks,
            buf_offset: 0,
            compressed_total: 0,
            running_crc: 0,
            eof: false,
        })
    };

    let index = archive.add_file(rel, source, true)?;
    if opts.encrypt {
        archive.set_entry_encryption(index)?;
    }
    shared.task.add_total(stat.size);
    Ok(())
}

/// Compress directory trees (or single files) into `archive` and commit it.
///
/// The archive must have been opened in `Create` mode; a default password
/// must be set when `opts.encrypt` is on. On any failure the staged
/// entries are discarded and the archive file is left untouched.
pub fn zip_dirs(
    task: &Arc<TaskState>,
    mut archive: Archive,
    roots: &[PathBuf],
    opts: &ZipDirsOptions,
) -> Result<()> {
    validate_options(roots, opts)?;

    let shared = Arc::new(CompressShared {
        task: Arc::clone(task),
        blocks: MessageQueue::new(),
        memory_gate: BoundedCounter::new(0, opts.max_memory),
        allocated_blocks: BoundedCounter::new(0, u64::MAX),
        level: opts.compress_level,
    });

    // traversal phase: stage every entry and queue every block
    let traversal: Result<()> = (|| {
        for root in roots {
            walk_dir(root, &opts.entry_base, opts.skip_top_level, &mut |abs, rel, stat| {
                if task.is_cancelled() {
                    return Err(ZipError::Cancelled);
                }
                if stat.is_dir {
                    archive.add_dir(rel, stat.mtime)?;
                    return Ok(());
                }
                if !stat.is_file {
                    return Ok(());
                }
                register_file(&mut archive, &shared, abs, rel, stat, opts)
            })?;
        }
        Ok(())
    })();
    if let Err(e) = traversal {
        shared.blocks.close();
        archive.discard();
        return Err(e);
    }

    // no more blocks: drained workers exit once the queue is empty
    shared.blocks.close();

    let pool = {
        let shared = Arc::clone(&shared);
        SimplePool::new(opts.threads, move || worker_loop(&shared))
    };

    // the container pulls every source here, in registration order
    let close_result = archive.close();

    if close_result.is_err() {
        task.cancel();
    }
    // wake any worker parked on admission before joining
    shared.memory_gate.invalidate();
    pool.join();

    if close_result.is_err() {
        // sources are only released after the workers have quiesced
        archive.discard();
    }
    drop(archive);

    if shared.memory_gate.get() != 0 || shared.allocated_blocks.get() != 0 {
        task.warn_log("block accounting leak detected");
    }

    // error precedence: first recorded worker error, then the commit error
    if let Some(err) = task.take_error() {
        return Err(err);
    }
    close_result?;
    if task.is_cancelled() {
        return Err(ZipError::Cancelled);
    }
    Ok(())
}

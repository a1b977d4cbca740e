//! Async task surface: terminal events, cancellation, progress polling.
//!
//! The event queue is process-wide, so the whole surface is exercised from
//! one test body to keep event consumption ordered.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use par_zip::{
    poll_event, unzip_to_dir_async, zip_dirs_async, Archive, NotifyAction, OpenMode,
    ZipDirsOptions, MIN_TASK_ID,
};

fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }
}

fn wait_event_for(task_id: i32) -> par_zip::NotifyMessage {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if let Some(msg) = poll_event() {
            if msg.task_id == task_id {
                return msg;
            }
            // the engine self-checks its block accounting on shutdown
            if let Some(text) = &msg.err_msg {
                assert!(!text.contains("leak"), "leak reported: {}", text);
            }
            // terminal events for other tasks are not expected in this
            // sequential test
            assert_ne!(msg.action, NotifyAction::Finish, "foreign finish event");
        }
    }
    panic!("no terminal event for task {}", task_id);
}

#[test]
fn async_surface_delivers_exactly_one_terminal_event() {
    let work = TempDir::new().unwrap();

    // -- zip_dirs_async happy path ---------------------------------------
    let src = work.path().join("tree");
    write_tree(
        &src,
        &[
            ("a.txt", b"alpha".to_vec()),
            ("sub/b.bin", vec![0xAB; 300_000]),
        ],
    );
    let zip_path = work.path().join("tree.zip");
    let archive = Archive::open(&zip_path, OpenMode::Create, None).unwrap();
    let task = zip_dirs_async(
        archive,
        vec![src.clone()],
        ZipDirsOptions {
            threads: 2,
            ..Default::default()
        },
    );
    assert!(task.id() >= MIN_TASK_ID);

    let msg = wait_event_for(task.id());
    assert_eq!(msg.action, NotifyAction::Finish);
    assert!(task.is_done());
    let progress = task.progress();
    assert_eq!(progress.processed_file_size, progress.total_file_size);

    // -- unzip_to_dir_async ----------------------------------------------
    let dest = work.path().join("dest");
    let archive = Archive::open(&zip_path, OpenMode::ReadOnly, None).unwrap();
    let task = unzip_to_dir_async(archive, vec![String::new()], dest.clone(), 2);
    let msg = wait_event_for(task.id());
    assert_eq!(msg.action, NotifyAction::Finish);
    assert_eq!(fs::read(dest.join("tree/a.txt")).unwrap(), b"alpha");

    // -- error terminal event ---------------------------------------------
    let archive = Archive::open(&zip_path, OpenMode::ReadOnly, None).unwrap();
    let task = unzip_to_dir_async(
        archive,
        vec!["missing.txt".to_string()],
        work.path().join("nowhere"),
        1,
    );
    let msg = wait_event_for(task.id());
    assert_eq!(msg.action, NotifyAction::Error);
    assert_eq!(msg.err_code, par_zip::ErrorCode::ZipEntryNotFound as i32);
    assert!(msg.err_msg.is_some());

    // -- cancellation ------------------------------------------------------
    let big_src = work.path().join("big");
    // enough data that compression cannot finish within the cancel window
    for i in 0..24 {
        let content: Vec<u8> = (0..2_000_000u32)
            .map(|j| ((j ^ (j >> 9)) as u8).wrapping_mul(i as u8 | 1))
            .collect();
        write_tree(&big_src, &[(&format!("f{}.bin", i), content)]);
    }
    let zip_path = work.path().join("cancelled.zip");
    let archive = Archive::open(&zip_path, OpenMode::Create, None).unwrap();
    let task = zip_dirs_async(
        archive,
        vec![big_src],
        ZipDirsOptions {
            threads: 2,
            compress_level: 9,
            ..Default::default()
        },
    );

    std::thread::sleep(Duration::from_millis(100));
    task.cancel();

    let start = Instant::now();
    let msg = wait_event_for(task.id());
    assert_eq!(msg.action, NotifyAction::Error);
    assert_eq!(msg.err_code, par_zip::ErrorCode::Cancelled as i32);
    // every worker exits promptly once the flag is observed
    assert!(
        start.elapsed() < Duration::from_secs(10),
        "cancellation took {:?}",
        start.elapsed()
    );
    // the aborted archive was discarded, not committed
    assert!(!zip_path.exists());
}

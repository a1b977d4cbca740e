//! TAR write/read round trips, including PAX and GNU long-name paths.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use tempfile::TempDir;

use par_zip::{tar_dir, untar_to_dir, TarWriter, ZipError};

fn write_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        if rel.ends_with('/') {
            fs::create_dir_all(&path).unwrap();
        } else {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
        }
    }
}

#[test]
fn simple_tree_round_trip() {
    let work = TempDir::new().unwrap();
    let src = work.path().join("tree");
    write_tree(
        &src,
        &[
            ("a.txt", b"hello tar".to_vec()),
            ("sub/", Vec::new()),
            ("sub/b.bin", vec![0x5A; 100_000]),
        ],
    );

    let tar_path = work.path().join("t.tar");
    tar_dir(&src, &tar_path, false).unwrap();

    let dest = work.path().join("dest");
    untar_to_dir(&tar_path, &dest).unwrap();

    assert_eq!(fs::read(dest.join("tree/a.txt")).unwrap(), b"hello tar");
    assert_eq!(fs::read(dest.join("tree/sub/b.bin")).unwrap(), vec![0x5A; 100_000]);
    assert!(dest.join("tree/sub").is_dir());
}

#[test]
fn file_mtime_survives() {
    let work = TempDir::new().unwrap();
    let src = work.path().join("m");
    write_tree(&src, &[("f.txt", b"stamped".to_vec())]);
    filetime::set_file_mtime(
        src.join("f.txt"),
        filetime::FileTime::from_unix_time(1_500_000_000, 0),
    )
    .unwrap();

    let tar_path = work.path().join("m.tar");
    tar_dir(&src, &tar_path, true).unwrap();
    let dest = work.path().join("dest");
    untar_to_dir(&tar_path, &dest).unwrap();

    let meta = fs::metadata(dest.join("f.txt")).unwrap();
    let restored = filetime::FileTime::from_last_modification_time(&meta).unix_seconds();
    assert_eq!(restored, 1_500_000_000);
}

#[test]
fn split_prefix_name_path_round_trips_without_pax() {
    let work = TempDir::new().unwrap();
    let src = work.path().join("s");
    // 120-byte directory part + short name: fits prefix/name split
    let deep = format!("{}/{}", "d".repeat(60), "e".repeat(59));
    write_tree(&src, &[(&format!("{}/leaf.txt", deep), b"deep".to_vec())]);

    let tar_path = work.path().join("s.tar");
    tar_dir(&src, &tar_path, true).unwrap();

    // no PAX header should be present for a splittable path
    let raw = fs::read(&tar_path).unwrap();
    assert!(!raw.chunks(512).any(|block| block[156] == b'x'));

    let dest = work.path().join("dest");
    untar_to_dir(&tar_path, &dest).unwrap();
    assert_eq!(
        fs::read(dest.join(&deep).join("leaf.txt")).unwrap(),
        b"deep"
    );
}

#[test]
fn long_component_forces_pax_header() {
    let work = TempDir::new().unwrap();
    let src = work.path().join("p");
    // a 150-byte final component cannot fit the name field or any split
    let long_name = format!("{}.txt", "n".repeat(146));
    write_tree(&src, &[(&long_name, b"pax payload".to_vec())]);

    let tar_path = work.path().join("p.tar");
    tar_dir(&src, &tar_path, true).unwrap();

    let raw = fs::read(&tar_path).unwrap();
    let pax_blocks = raw.chunks(512).filter(|b| b[156] == b'x').count();
    assert_eq!(pax_blocks, 1, "expected exactly one extended header");

    let dest = work.path().join("dest");
    untar_to_dir(&tar_path, &dest).unwrap();
    assert_eq!(fs::read(dest.join(&long_name)).unwrap(), b"pax payload");
}

#[test]
fn very_long_nested_path_round_trips() {
    let work = TempDir::new().unwrap();
    let src = work.path().join("deep");

    // ~250 bytes of nested directories, beyond the prefix field
    let parts: Vec<String> = (0..6).map(|i| format!("dir{}-{}", i, "x".repeat(35))).collect();
    let rel_dir = parts.join("/");
    write_tree(&src, &[(&format!("{}/end.txt", rel_dir), b"far down".to_vec())]);

    let tar_path = work.path().join("deep.tar");
    tar_dir(&src, &tar_path, true).unwrap();

    let dest = work.path().join("dest");
    untar_to_dir(&tar_path, &dest).unwrap();

    let mut path = dest.clone();
    for part in &parts {
        path = path.join(part);
    }
    assert_eq!(fs::read(path.join("end.txt")).unwrap(), b"far down");
}

#[test]
fn gnu_long_name_headers_round_trip() {
    let work = TempDir::new().unwrap();
    let tar_path = work.path().join("gnu.tar");

    // first component larger than the prefix field, so no split exists
    let long_name = format!("{}/file.txt", "g".repeat(160));
    let content = b"gnu long name payload".to_vec();
    {
        let out = BufWriter::new(File::create(&tar_path).unwrap());
        let mut writer = TarWriter::with_gnu_long_names(out);
        writer
            .add_file(&long_name, 1_400_000_000, content.len() as u64, &mut &content[..])
            .unwrap();
        writer.finish().unwrap();
    }

    // typeflag 'L' marks the GNU long-name header
    let raw = fs::read(&tar_path).unwrap();
    assert!(raw.chunks(512).any(|b| b[156] == b'L'));

    let dest = work.path().join("dest");
    untar_to_dir(&tar_path, &dest).unwrap();
    assert_eq!(fs::read(dest.join(&long_name)).unwrap(), content);
}

#[test]
fn malicious_tar_path_is_refused() {
    let work = TempDir::new().unwrap();
    let tar_path = work.path().join("evil.tar");
    {
        let out = BufWriter::new(File::create(&tar_path).unwrap());
        let mut writer = TarWriter::new(out);
        let payload = b"escape".to_vec();
        writer
            .add_file("../evil.txt", 0, payload.len() as u64, &mut &payload[..])
            .unwrap();
        writer.finish().unwrap();
    }

    let dest = work.path().join("dest");
    fs::create_dir_all(&dest).unwrap();
    let err = untar_to_dir(&tar_path, &dest).unwrap_err();
    assert!(matches!(err, ZipError::MaliciousPath(_)));
    assert!(!work.path().join("evil.txt").exists());
}

#[test]
fn corrupted_checksum_is_detected() {
    let work = TempDir::new().unwrap();
    let src = work.path().join("c");
    write_tree(&src, &[("f.txt", b"payload".to_vec())]);
    let tar_path = work.path().join("c.tar");
    tar_dir(&src, &tar_path, true).unwrap();

    let mut raw = fs::read(&tar_path).unwrap();
    raw[0] ^= 0xFF; // flip a byte inside the first header's name field
    fs::write(&tar_path, &raw).unwrap();

    let err = untar_to_dir(&tar_path, &work.path().join("dest")).unwrap_err();
    assert!(matches!(err, ZipError::InvalidFormat(_)));
}

#[test]
fn system_tar_reads_our_output() {
    // cross-check with GNU/BSD tar when available
    use std::process::Command;
    if Command::new("tar").arg("--version").output().is_err() {
        eprintln!("skipping test: `tar` not found");
        return;
    }

    let work = TempDir::new().unwrap();
    let src = work.path().join("x");
    let long_name = format!("{}.dat", "l".repeat(120));
    write_tree(
        &src,
        &[
            ("plain.txt", b"plain".to_vec()),
            (&long_name, b"needs pax".to_vec()),
        ],
    );
    let tar_path = work.path().join("x.tar");
    tar_dir(&src, &tar_path, true).unwrap();

    let dest = work.path().join("sysdest");
    fs::create_dir_all(&dest).unwrap();
    let output = Command::new("tar")
        .arg("-xf")
        .arg(&tar_path)
        .arg("-C")
        .arg(&dest)
        .output()
        .expect("failed to run tar");
    assert!(
        output.status.success(),
        "tar failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(fs::read(dest.join("plain.txt")).unwrap(), b"plain");
    assert_eq!(fs::read(dest.join(&long_name)).unwrap(), b"needs pax");
}

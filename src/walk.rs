//! Recursive directory traversal shared by the ZIP and TAR writers.
//!
//! Yields every directory and regular file under a root in deterministic
//! pre-order (sorted by file name), as `(absolute_path, archive_relative,
//! stat)` triples. Directory entries carry a trailing `/` in their
//! archive-relative path. Symlinks are never followed and never yielded, so
//! cyclic links cannot loop the walk; `.` and `..` never appear.

use std::path::Path;

use filetime::FileTime;
use walkdir::WalkDir;

use crate::error::{Result, ZipError};

/// Platform-independent stat for a yielded entry.
#[derive(Debug, Clone, Copy)]
pub struct WalkStat {
    pub is_dir: bool,
    pub is_file: bool,
    pub size: u64,
    /// Modification time in Unix-epoch seconds.
    pub mtime: i64,
}

impl WalkStat {
    fn from_metadata(meta: &std::fs::Metadata) -> Self {
        WalkStat {
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            size: if meta.is_file() { meta.len() } else { 0 },
            mtime: FileTime::from_last_modification_time(meta).unix_seconds(),
        }
    }
}

/// Callback invoked per entry; returning an error aborts the walk.
pub type WalkCallback<'a> = dyn FnMut(&Path, &str, &WalkStat) -> Result<()> + 'a;

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Walk `root`, yielding archive-relative paths under `base`.
///
/// With `skip_top_level` the children of `root` become the top of the
/// archive (prefixed by `base`); otherwise the final component of `root`
/// is itself the top-level archive directory. A regular-file root yields
/// exactly that file. A missing or symlink root is reported as not found.
pub fn walk_dir(
    root: &Path,
    base: &str,
    skip_top_level: bool,
    cb: &mut WalkCallback<'_>,
) -> Result<()> {
    let meta = std::fs::symlink_metadata(root)
        .map_err(|_| ZipError::FileNotFound(root.display().to_string()))?;
    if meta.file_type().is_symlink() {
        return Err(ZipError::FileNotFound(root.display().to_string()));
    }

    if meta.is_file() {
        let rel = format!("{}{}", base, file_name_of(root));
        let stat = WalkStat::from_metadata(&meta);
        return cb(root, &rel, &stat);
    }
    if !meta.is_dir() {
        return Ok(()); // sockets, devices, ... are ignored
    }

    let prefix = if skip_top_level {
        base.to_string()
    } else {
        format!("{}{}/", base, file_name_of(root))
    };

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        if entry.path_is_symlink() {
            continue;
        }

        if entry.depth() == 0 {
            // the root itself; only yielded when its relative path is
            // non-empty (a skip-top walk with an empty base has no
            // corresponding entry)
            if !prefix.is_empty() {
                let meta = entry.metadata()?;
                let stat = WalkStat::from_metadata(&meta);
                cb(entry.path(), &prefix, &stat)?;
            }
            continue;
        }

        let file_type = entry.file_type();
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }

        let rel_os = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ZipError::Internal(e.to_string()))?;
        let mut rel = String::with_capacity(prefix.len() + 32);
        rel.push_str(&prefix);
        for (i, comp) in rel_os.components().enumerate() {
            if i > 0 {
                rel.push('/');
            }
            rel.push_str(&comp.as_os_str().to_string_lossy());
        }
        if file_type.is_dir() {
            rel.push('/');
        }

        let meta = entry.metadata()?;
        let stat = WalkStat::from_metadata(&meta);
        cb(entry.path(), &rel, &stat)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn collect(root: &Path, base: &str, skip_top: bool) -> Vec<String> {
        let mut seen = Vec::new();
        walk_dir(root, base, skip_top, &mut |_, rel, _| {
            seen.push(rel.to_string());
            Ok(())
        })
        .unwrap();
        seen
    }

    fn make_tree(dir: &TempDir) -> std::path::PathBuf {
        let root = dir.path().join("top");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();
        fs::write(root.join("sub/b.txt"), b"bb").unwrap();
        root
    }

    #[test]
    fn yields_top_level_directory() {
        let dir = TempDir::new().unwrap();
        let root = make_tree(&dir);
        let seen = collect(&root, "", false);
        assert_eq!(seen, vec!["top/", "top/a.txt", "top/sub/", "top/sub/b.txt"]);
    }

    #[test]
    fn skip_top_level_promotes_children() {
        let dir = TempDir::new().unwrap();
        let root = make_tree(&dir);
        let seen = collect(&root, "", true);
        assert_eq!(seen, vec!["a.txt", "sub/", "sub/b.txt"]);
    }

    #[test]
    fn base_prefixes_every_entry() {
        let dir = TempDir::new().unwrap();
        let root = make_tree(&dir);
        let seen = collect(&root, "x/", true);
        assert_eq!(seen, vec!["x/", "x/a.txt", "x/sub/", "x/sub/b.txt"]);
    }

    #[test]
    fn file_root_yields_single_file() {
        let dir = TempDir::new().unwrap();
        let root = make_tree(&dir);
        let seen = collect(&root.join("a.txt"), "", false);
        assert_eq!(seen, vec!["a.txt"]);
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = walk_dir(&dir.path().join("nope"), "", false, &mut |_, _, _| Ok(()));
        assert!(matches!(err, Err(ZipError::FileNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let root = make_tree(&dir);
        std::os::unix::fs::symlink(root.join("a.txt"), root.join("link.txt")).unwrap();
        let seen = collect(&root, "", true);
        assert_eq!(seen, vec!["a.txt", "sub/", "sub/b.txt"]);
    }

    #[test]
    fn stat_reports_size_and_kind() {
        let dir = TempDir::new().unwrap();
        let root = make_tree(&dir);
        walk_dir(&root, "", true, &mut |_, rel, stat| {
            if rel == "sub/b.txt" {
                assert!(stat.is_file);
                assert_eq!(stat.size, 2);
                assert!(stat.mtime > 0);
            }
            if rel == "sub/" {
                assert!(stat.is_dir);
            }
            Ok(())
        })
        .unwrap();
    }
}

//! Bulk entry mutation: delete, rename, move.
//!
//! All three share the directory-prefix convention: a path with a trailing
//! `/` (or the empty string) addresses every entry under that prefix; a
//! plain path addresses exactly one entry. Changes are staged on the
//! archive handle and take effect on `close`.

use crate::archive::Archive;
use crate::error::{Result, ZipError};
use crate::paths;

/// Delete entries. A directory prefix removes every entry under it.
pub fn remove_entries(archive: &mut Archive, entry_paths: &[String]) -> Result<()> {
    for path in entry_paths {
        if !paths::is_dir_entry(path) {
            let index = archive
                .locate(path)
                .ok_or_else(|| ZipError::EntryNotFound(path.clone()))?;
            archive.delete(index)?;
            continue;
        }

        let mut found = false;
        for index in 0..archive.num_entries() {
            let Ok(stat) = archive.stat_at(index) else {
                continue;
            };
            if !stat.name.starts_with(path.as_str()) {
                continue;
            }
            archive.delete(index)?;
            found = true;
        }
        if !found {
            return Err(ZipError::EntryNotFound(path.clone()));
        }
    }
    Ok(())
}

/// Rename a file entry, or every entry under a directory prefix.
///
/// When a directory is renamed to the root (`""`), the directory entry
/// itself would end up with an empty name and is silently dropped; its
/// children land in the root.
pub fn rename_entry(archive: &mut Archive, entry_path: &str, new_entry_path: &str) -> Result<()> {
    if !paths::is_dir_entry(entry_path) {
        let index = archive
            .locate(entry_path)
            .ok_or_else(|| ZipError::EntryNotFound(entry_path.to_string()))?;
        return archive.rename(index, new_entry_path);
    }

    if !new_entry_path.is_empty() && !new_entry_path.ends_with('/') {
        return Err(ZipError::InvalidPath(new_entry_path.to_string()));
    }

    let mut found = false;
    for index in 0..archive.num_entries() {
        let Ok(stat) = archive.stat_at(index) else {
            continue;
        };
        if !stat.name.starts_with(entry_path) {
            continue;
        }
        let new_name = format!("{}{}", new_entry_path, &stat.name[entry_path.len()..]);
        if new_name.is_empty() {
            continue;
        }
        archive.rename(index, &new_name)?;
        found = true;
    }
    if !found {
        return Err(ZipError::EntryNotFound(entry_path.to_string()));
    }
    Ok(())
}

/// Move entries under `new_base` (empty for the root, otherwise ending
/// with `/`), keeping each entry's base name.
pub fn move_entries(archive: &mut Archive, entry_paths: &[String], new_base: &str) -> Result<()> {
    if !new_base.is_empty() && !new_base.ends_with('/') {
        return Err(ZipError::InvalidPath(new_base.to_string()));
    }

    for old_path in entry_paths {
        let base_name = paths::entry_basename(old_path);
        let new_path = if old_path.ends_with('/') {
            format!("{}{}/", new_base, base_name)
        } else {
            format!("{}{}", new_base, base_name)
        };
        rename_entry(archive, old_path, &new_path)?;
    }
    Ok(())
}

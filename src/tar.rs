//! TAR writer and reader (POSIX ustar + PAX, GNU long names).
//!
//! Headers are 512-byte blocks with zero-padded octal numeric fields. The
//! writer places a path in the `name` field when it fits (100 bytes),
//! splits it across `prefix`/`name` when possible (155/100), and otherwise
//! emits a PAX `x` header carrying a `path` record; a `size` record is
//! added when a file exceeds the 8 GiB octal size field. GNU `L` headers
//! are available instead of PAX for long names. The reader consumes all
//! of `L`, `K`, `x` and `g` plus plain ustar. An archive ends with two
//! all-zero blocks.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use filetime::FileTime;

use crate::error::{Result, ZipError};
use crate::paths;
use crate::walk::walk_dir;

const BLOCK_SIZE: usize = 512;
const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;

const OFF_NAME: usize = 0;
const OFF_MODE: usize = 100;
const OFF_SIZE: usize = 124;
const OFF_MTIME: usize = 136;
const OFF_CHKSUM: usize = 148;
const OFF_TYPEFLAG: usize = 156;
const OFF_MAGIC: usize = 257;
const OFF_VERSION: usize = 263;
const OFF_PREFIX: usize = 345;

const TYPE_FILE: u8 = b'0';
const TYPE_DIR: u8 = b'5';
const TYPE_GNU_LONGNAME: u8 = b'L';
const TYPE_GNU_LONGLINK: u8 = b'K';
const TYPE_PAX: u8 = b'x';
const TYPE_PAX_GLOBAL: u8 = b'g';

const ZERO_BLOCK: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

fn round_up_512(v: u64) -> u64 {
    (v + 511) & !511
}

/// Write `value` as zero-padded octal with a trailing NUL. Fails when the
/// field cannot hold the value.
fn put_octal(field: &mut [u8], value: u64) -> bool {
    let digits = field.len() - 1;
    let mut v = value;
    field[digits] = 0;
    for i in (0..digits).rev() {
        field[i] = b'0' + (v & 7) as u8;
        v >>= 3;
    }
    v == 0
}

fn parse_octal(field: &[u8]) -> u64 {
    let mut v = 0u64;
    for &b in field {
        if !(b'0'..=b'7').contains(&b) {
            break;
        }
        v = (v << 3) | (b - b'0') as u64;
    }
    v
}

fn header_checksum(block: &[u8; BLOCK_SIZE]) -> u64 {
    let mut sum = 0u64;
    for (i, &b) in block.iter().enumerate() {
        if (OFF_CHKSUM..OFF_CHKSUM + 8).contains(&i) {
            sum += b' ' as u64;
        } else {
            sum += b as u64;
        }
    }
    sum
}

struct TarHeader {
    block: [u8; BLOCK_SIZE],
}

impl TarHeader {
    fn new(typeflag: u8) -> Self {
        let mut block = [0u8; BLOCK_SIZE];
        block[OFF_TYPEFLAG] = typeflag;
        block[OFF_MODE..OFF_MODE + 8].copy_from_slice(b"0000644\0");
        TarHeader { block }
    }

    /// Place the path in `name`, or split across `prefix`/`name`.
    /// Returns false when the path needs an extended header.
    fn set_path(&mut self, relpath: &str) -> bool {
        let bytes = relpath.as_bytes();
        if bytes.len() <= NAME_LEN {
            self.block[OFF_NAME..OFF_NAME + bytes.len()].copy_from_slice(bytes);
            return true;
        }
        // find a split where prefix <= 155 and name <= 100; the split
        // slash itself is stored in neither field
        for (i, &b) in bytes.iter().enumerate().rev() {
            if b != b'/' {
                continue;
            }
            let (prefix, name) = (&bytes[..i], &bytes[i + 1..]);
            if prefix.len() <= PREFIX_LEN && !name.is_empty() && name.len() <= NAME_LEN {
                self.block[OFF_PREFIX..OFF_PREFIX + prefix.len()].copy_from_slice(prefix);
                self.block[OFF_NAME..OFF_NAME + name.len()].copy_from_slice(name);
                return true;
            }
        }
        false
    }

    /// Returns false when the value overflows the 12-byte octal field.
    fn set_size(&mut self, size: u64) -> bool {
        put_octal(&mut self.block[OFF_SIZE..OFF_SIZE + 12], size)
    }

    fn set_mtime(&mut self, mtime: i64) {
        put_octal(&mut self.block[OFF_MTIME..OFF_MTIME + 12], mtime.max(0) as u64);
    }

    /// Fill magic, version and checksum, then emit the block.
    fn write_to<W: Write>(&mut self, out: &mut W) -> Result<()> {
        self.block[OFF_MAGIC..OFF_MAGIC + 6].copy_from_slice(b"ustar\0");
        self.block[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(b"00");
        let sum = header_checksum(&self.block);
        let chksum = &mut self.block[OFF_CHKSUM..OFF_CHKSUM + 8];
        // six octal digits, NUL, space
        put_octal(&mut chksum[..7], sum);
        chksum[7] = b' ';
        out.write_all(&self.block)?;
        Ok(())
    }
}

fn write_padding<W: Write>(out: &mut W, data_size: u64) -> Result<()> {
    let pad = (round_up_512(data_size) - data_size) as usize;
    if pad > 0 {
        out.write_all(&ZERO_BLOCK[..pad])?;
    }
    Ok(())
}

/// `<len> <key>=<value>\n` where `<len>` counts the whole line including
/// its own digits.
fn pax_line(key: &str, value: &str) -> String {
    let base = key.len() + value.len() + 3; // space, '=', newline
    let mut digits = 1;
    loop {
        let total = base + digits;
        if total.to_string().len() == digits {
            return format!("{} {}={}\n", total, key, value);
        }
        digits += 1;
    }
}

// ---------------------------------------------------------------------------
// writer
// ---------------------------------------------------------------------------

/// Streaming TAR writer.
pub struct TarWriter<W: Write> {
    out: W,
    /// Long paths go to a PAX `x` header; with `false`, a GNU `L` header
    /// is used instead (unless a PAX header is needed anyway).
    use_pax: bool,
}

impl<W: Write> TarWriter<W> {
    pub fn new(out: W) -> Self {
        TarWriter { out, use_pax: true }
    }

    pub fn with_gnu_long_names(out: W) -> Self {
        TarWriter { out, use_pax: false }
    }

    fn write_gnu_long_name(&mut self, typeflag: u8, value: &str) -> Result<()> {
        let payload_len = value.len() as u64 + 1; // trailing NUL included
        let mut hdr = TarHeader::new(typeflag);
        hdr.set_size(payload_len);
        hdr.write_to(&mut self.out)?;
        self.out.write_all(value.as_bytes())?;
        self.out.write_all(&[0])?;
        write_padding(&mut self.out, payload_len)?;
        Ok(())
    }

    fn write_pax_header(&mut self, path: Option<&str>, size: Option<u64>) -> Result<()> {
        let mut payload = String::new();
        if let Some(path) = path {
            payload.push_str(&pax_line("path", path));
        }
        if let Some(size) = size {
            payload.push_str(&pax_line("size", &size.to_string()));
        }

        let mut hdr = TarHeader::new(TYPE_PAX);
        hdr.set_size(payload.len() as u64);
        hdr.write_to(&mut self.out)?;
        self.out.write_all(payload.as_bytes())?;
        write_padding(&mut self.out, payload.len() as u64)?;
        Ok(())
    }

    fn write_entry_header(
        &mut self,
        relpath: &str,
        mtime: i64,
        size: Option<u64>,
        typeflag: u8,
    ) -> Result<()> {
        let mut hdr = TarHeader::new(typeflag);
        hdr.set_mtime(mtime);
        let size_fits = match size {
            Some(size) => hdr.set_size(size),
            None => true, // directory: size field stays empty
        };
        let path_fits = hdr.set_path(relpath);

        if !path_fits && !self.use_pax && size_fits {
            self.write_gnu_long_name(TYPE_GNU_LONGNAME, relpath)?;
        } else if !path_fits || !size_fits {
            self.write_pax_header(
                (!path_fits).then_some(relpath),
                (!size_fits).then(|| size.unwrap_or(0)),
            )?;
        }
        hdr.write_to(&mut self.out)
    }

    /// Append a directory entry (trailing `/` is added if missing).
    pub fn add_dir(&mut self, relpath: &str, mtime: i64) -> Result<()> {
        let name = if relpath.ends_with('/') {
            relpath.to_string()
        } else {
            format!("{}/", relpath)
        };
        self.write_entry_header(&name, mtime, None, TYPE_DIR)
    }

    /// Append a regular file entry, streaming `size` bytes from `content`.
    pub fn add_file(
        &mut self,
        relpath: &str,
        mtime: i64,
        size: u64,
        content: &mut dyn Read,
    ) -> Result<()> {
        self.write_entry_header(relpath, mtime, Some(size), TYPE_FILE)?;

        let mut buf = [0u8; 16 * 1024];
        let mut left = size;
        while left > 0 {
            let want = (buf.len() as u64).min(left) as usize;
            content.read_exact(&mut buf[..want])?;
            self.out.write_all(&buf[..want])?;
            left -= want as u64;
        }
        write_padding(&mut self.out, size)
    }

    /// Terminate the archive with two zero blocks and return the output.
    pub fn finish(mut self) -> Result<W> {
        self.out.write_all(&ZERO_BLOCK)?;
        self.out.write_all(&ZERO_BLOCK)?;
        Ok(self.out)
    }
}

/// Archive a directory tree (or single file) into a TAR file, sharing the
/// traversal contract of the ZIP engine.
pub fn tar_dir<P: AsRef<Path>, Q: AsRef<Path>>(
    dir_path: P,
    tar_path: Q,
    skip_top_level: bool,
) -> Result<()> {
    let file = BufWriter::new(File::create(tar_path.as_ref())?);
    let mut writer = TarWriter::new(file);

    walk_dir(dir_path.as_ref(), "", skip_top_level, &mut |abs, rel, stat| {
        if stat.is_dir {
            writer.add_dir(rel, stat.mtime)
        } else if stat.is_file {
            let mut f = File::open(abs)?;
            writer.add_file(rel, stat.mtime, stat.size, &mut f)
        } else {
            Ok(())
        }
    })?;

    let mut out = writer.finish()?;
    out.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// reader
// ---------------------------------------------------------------------------

fn read_block(tar: &mut BufReader<File>) -> Result<Option<[u8; BLOCK_SIZE]>> {
    let mut block = [0u8; BLOCK_SIZE];
    match tar.read_exact(&mut block) {
        Ok(()) => Ok(Some(block)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read a rounded-up payload of `size` bytes; trailing NULs trimmed.
fn read_string_payload(tar: &mut BufReader<File>, size: u64) -> Result<String> {
    let mut buf = vec![0u8; round_up_512(size) as usize];
    tar.read_exact(&mut buf)?;
    buf.truncate(size as usize);
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse PAX `<len> <key>=<value>\n` records into `map`. Any malformed
/// line aborts the header immediately.
fn parse_pax_payload(tar: &mut BufReader<File>, size: u64, map: &mut HashMap<String, String>) -> Result<()> {
    let mut content = vec![0u8; round_up_512(size) as usize];
    tar.read_exact(&mut content)?;
    content.truncate(size as usize);

    let malformed = || ZipError::InvalidFormat("malformed extended header record".to_string());

    let mut p = 0usize;
    while p < content.len() {
        let digits_start = p;
        while p < content.len() && content[p].is_ascii_digit() {
            p += 1;
        }
        if p == digits_start || p >= content.len() || content[p] != b' ' {
            return Err(malformed());
        }
        let len: usize = std::str::from_utf8(&content[digits_start..p])
            .map_err(|_| malformed())?
            .parse()
            .map_err(|_| malformed())?;
        let line_end = digits_start.checked_add(len).ok_or_else(malformed)?;
        if len == 0 || line_end > content.len() || content[line_end - 1] != b'\n' {
            return Err(malformed());
        }

        let record = &content[p + 1..line_end - 1];
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(malformed)?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
        map.insert(key, value);
        p = line_end;
    }
    Ok(())
}

fn write_file_content(
    tar: &mut BufReader<File>,
    out_path: &Path,
    size: u64,
) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(|_| ZipError::Mkdir(parent.display().to_string()))?;
    }
    let mut out = File::create(out_path)?;
    let mut buf = [0u8; 8 * 1024];
    let mut left = size;
    while left > 0 {
        let want = (buf.len() as u64).min(left) as usize;
        tar.read_exact(&mut buf[..want])?;
        out.write_all(&buf[..want])?;
        left -= want as u64;
    }
    drop(out);
    tar.seek(SeekFrom::Current((round_up_512(size) - size) as i64))?;
    Ok(())
}

fn header_path(block: &[u8; BLOCK_SIZE]) -> String {
    let field_str = |field: &[u8]| -> String {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    };
    let name = field_str(&block[OFF_NAME..OFF_NAME + NAME_LEN]);
    let prefix = field_str(&block[OFF_PREFIX..OFF_PREFIX + PREFIX_LEN]);
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Extract a TAR archive into `dest_dir`.
pub fn untar_to_dir<P: AsRef<Path>, Q: AsRef<Path>>(tar_path: P, dest_dir: Q) -> Result<()> {
    let mut tar = BufReader::new(File::open(tar_path.as_ref())?);
    let dest_dir = dest_dir.as_ref();

    let mut long_name: Option<String> = None;
    let mut pax: HashMap<String, String> = HashMap::new();
    let mut pax_global: HashMap<String, String> = HashMap::new();

    while let Some(block) = read_block(&mut tar)? {
        if block == ZERO_BLOCK {
            break; // end-of-archive marker
        }

        let stored = parse_octal(&block[OFF_CHKSUM..OFF_CHKSUM + 8]);
        if stored != header_checksum(&block) {
            return Err(ZipError::InvalidFormat("tar header checksum mismatch".to_string()));
        }

        let size = parse_octal(&block[OFF_SIZE..OFF_SIZE + 12]);
        let typeflag = block[OFF_TYPEFLAG];
        match typeflag {
            TYPE_GNU_LONGNAME => {
                long_name = Some(read_string_payload(&mut tar, size)?);
                continue;
            }
            TYPE_GNU_LONGLINK => {
                // linknames are consumed for stream sync; symlink entries
                // are not recreated
                let _ = read_string_payload(&mut tar, size)?;
                continue;
            }
            TYPE_PAX => {
                parse_pax_payload(&mut tar, size, &mut pax)?;
                continue;
            }
            TYPE_PAX_GLOBAL => {
                parse_pax_payload(&mut tar, size, &mut pax_global)?;
                continue;
            }
            0 | TYPE_FILE | TYPE_DIR => {}
            _ => {
                // unsupported entry kind: skip its payload
                tar.seek(SeekFrom::Current(round_up_512(size) as i64))?;
                long_name = None;
                pax.clear();
                continue;
            }
        }

        // long-name sources take precedence over the header fields
        let rel_path = long_name
            .take()
            .or_else(|| pax.remove("path"))
            .or_else(|| pax_global.get("path").cloned())
            .unwrap_or_else(|| header_path(&block));
        let size = pax
            .remove("size")
            .and_then(|v| v.parse().ok())
            .unwrap_or(size);

        if paths::is_malicious_path(&rel_path) {
            return Err(ZipError::MaliciousPath(rel_path));
        }

        let out_path = paths::join_entry_path(dest_dir, &rel_path);
        let mtime = parse_octal(&block[OFF_MTIME..OFF_MTIME + 12]) as i64;

        if typeflag == TYPE_DIR {
            fs::create_dir_all(&out_path)
                .map_err(|_| ZipError::Mkdir(out_path.display().to_string()))?;
        } else {
            write_file_content(&mut tar, &out_path, size)?;
            let _ = filetime::set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
        }

        pax.clear();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octal_round_trip() {
        let mut field = [0u8; 12];
        assert!(put_octal(&mut field, 0o755));
        assert_eq!(parse_octal(&field), 0o755);

        assert!(put_octal(&mut field, 0));
        assert_eq!(parse_octal(&field), 0);

        // 8 GiB does not fit 11 octal digits
        assert!(!put_octal(&mut field, 8 * 1024 * 1024 * 1024));
        assert!(put_octal(&mut field, 8 * 1024 * 1024 * 1024 - 1));
    }

    #[test]
    fn pax_line_length_includes_itself() {
        // "xx path=value\n" style self-counting length
        let line = pax_line("path", "some/file.txt");
        let (len_str, rest) = line.split_once(' ').unwrap();
        let len: usize = len_str.parse().unwrap();
        assert_eq!(len, line.len());
        assert!(rest.starts_with("path="));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn pax_line_length_at_digit_boundary() {
        // force totals around the 9/10 and 99/100 boundaries
        for value_len in [1usize, 2, 3, 80, 90, 91, 92, 93, 94, 95] {
            let value = "v".repeat(value_len);
            let line = pax_line("k", &value);
            let len: usize = line.split_once(' ').unwrap().0.parse().unwrap();
            assert_eq!(len, line.len(), "value_len={}", value_len);
        }
    }

    #[test]
    fn header_path_split() {
        let mut hdr = TarHeader::new(TYPE_FILE);
        let long = format!("{}/{}", "p".repeat(120), "n".repeat(40));
        assert!(hdr.set_path(&long));
        assert_eq!(header_path(&hdr.block), long);
    }

    #[test]
    fn header_path_too_long_for_split() {
        let mut hdr = TarHeader::new(TYPE_FILE);
        // a single component longer than the name field cannot be split
        let long = "x".repeat(150);
        assert!(!hdr.set_path(&long));
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut hdr = TarHeader::new(TYPE_FILE);
        hdr.set_path("a.txt");
        hdr.set_size(5);
        let mut out = Vec::new();
        hdr.write_to(&mut out).unwrap();

        let block: [u8; BLOCK_SIZE] = out[..BLOCK_SIZE].try_into().unwrap();
        assert_eq!(parse_octal(&block[OFF_CHKSUM..OFF_CHKSUM + 8]), header_checksum(&block));

        let mut corrupted = block;
        corrupted[0] ^= 0xFF;
        assert_ne!(
            parse_octal(&corrupted[OFF_CHKSUM..OFF_CHKSUM + 8]),
            header_checksum(&corrupted)
        );
    }
}

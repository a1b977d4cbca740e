//! ZIP container: central directory, entry streams, mutation, commit.
//!
//! An [`Archive`] handle reads the central directory eagerly on open.
//! Mutations (add/rename/delete) are staged in memory; [`Archive::close`]
//! commits them by streaming every pending source and raw-copying every
//! retained entry into a temp file that atomically replaces the archive.
//! [`Archive::discard`] abandons staged changes.
//!
//! New file entries are pulled from an [`EntrySource`], which hands the
//! container an already-encoded (DEFLATE or stored) payload plus its final
//! stat; the parallel compress engine plugs its block-stitching source in
//! here. Entries marked for encryption are wrapped in the WinZip AE-2
//! framing (salt, verifier, AES-256-CTR payload, auth code) on the way out.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::DeflateDecoder;

use crate::encryption::{
    EntryDecryptor, EntryEncryptor, AUTH_CODE_LEN, SALT_LEN, VERIFY_LEN, WINZIP_AES256,
};
use crate::error::{Result, ZipError};
use crate::paths;

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_EOCD_LOCATOR_SIG: u32 = 0x0706_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;

const ZIP64_EXTRA_ID: u16 = 0x0001;
const AES_EXTRA_ID: u16 = 0x9901;

/// Stored (no compression).
pub const METHOD_STORED: u16 = 0;
/// DEFLATE.
pub const METHOD_DEFLATE: u16 = 8;
/// WinZip AES marker method; the real method lives in the AES extra field.
pub const METHOD_AES: u16 = 99;

const FLAG_ENCRYPTED: u16 = 0x0001;
const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
const FLAG_UTF8: u16 = 0x0800;

const COPY_BUF_SIZE: usize = 16 * 1024;

// ---------------------------------------------------------------------------
// DOS date/time (2-second granularity, 1980 epoch)
// ---------------------------------------------------------------------------

fn days_from_civil(mut y: i64, m: i64, d: i64) -> i64 {
    y -= (m <= 2) as i64;
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let doy = (153 * (m + if m > 2 { -3 } else { 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = z.div_euclid(146097);
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = mp + if mp < 10 { 3 } else { -9 };
    (y + (m <= 2) as i64, m, d)
}

fn unix_to_dos(mtime: i64) -> (u16, u16) {
    let days = mtime.div_euclid(86400);
    let secs = mtime.rem_euclid(86400);
    let (y, m, d) = civil_from_days(days);
    if y < 1980 {
        return (0, 0x21); // 1980-01-01 00:00:00
    }
    let (h, min, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let time = ((h as u16) << 11) | ((min as u16) << 5) | ((s / 2) as u16);
    let date = (((y - 1980) as u16) << 9) | ((m as u16) << 5) | (d as u16);
    (time, date)
}

fn dos_to_unix(time: u16, date: u16) -> i64 {
    let y = ((date >> 9) & 0x7F) as i64 + 1980;
    let m = ((date >> 5) & 0x0F) as i64;
    let d = (date & 0x1F) as i64;
    let h = ((time >> 11) & 0x1F) as i64;
    let min = ((time >> 5) & 0x3F) as i64;
    let s = ((time & 0x1F) as i64) * 2;
    days_from_civil(y, m.max(1), d.max(1)) * 86400 + h * 3600 + min * 60 + s
}

// ---------------------------------------------------------------------------
// little-endian read/write helpers
// ---------------------------------------------------------------------------

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn w16<W: Write>(w: &mut W, v: u16) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn w32<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn w64<W: Write>(w: &mut W, v: u64) -> Result<()> {
    w.write_all(&v.to_le_bytes())?;
    Ok(())
}

// ---------------------------------------------------------------------------
// entry model
// ---------------------------------------------------------------------------

/// Stat of a committed archive entry.
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub index: usize,
    pub name: String,
    /// Uncompressed size.
    pub size: u64,
    pub comp_size: u64,
    /// Modification time in Unix-epoch seconds (2-second granularity).
    pub mtime: i64,
    /// CRC-32 of the uncompressed content; 0 for encrypted entries.
    pub crc32: u32,
    pub encrypted: bool,
}

impl EntryStat {
    /// A trailing `/` denotes a directory entry.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

#[derive(Debug, Clone, Copy)]
struct AesExtra {
    /// AE-1 or AE-2 vendor version.
    version: u16,
    strength: u8,
    /// The real compression method behind the AES wrapping.
    method: u16,
}

#[derive(Debug, Clone)]
struct CdEntry {
    name: String,
    crc32: u32,
    comp_size: u64,
    size: u64,
    method: u16,
    dos_time: u16,
    dos_date: u16,
    offset: u64,
    aes: Option<AesExtra>,
    deleted: bool,
}

/// Stat reported by an [`EntrySource`]. `method` and `mtime` are always
/// valid; `size`, `comp_size` and `crc32` are final once the source has
/// been drained.
#[derive(Debug, Clone, Copy)]
pub struct SourceStat {
    pub size: u64,
    pub comp_size: u64,
    pub crc32: u32,
    /// Wire compression method of the payload this source yields.
    pub method: u16,
    pub mtime: i64,
}

/// Pull interface the container drains during [`Archive::close`].
///
/// `open` is called once before the first `read`; `read` returning 0 marks
/// the end of the payload, after which `stat` must report final sizes and
/// CRC. Dropping the source releases whatever it still holds.
pub trait EntrySource: Send {
    fn open(&mut self) -> Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn stat(&self) -> SourceStat;
    fn close(&mut self) {}
}

/// Source for a zero-length file: stored, empty, CRC 0.
pub struct EmptySource {
    mtime: i64,
}

impl EmptySource {
    pub fn new(mtime: i64) -> Self {
        EmptySource { mtime }
    }
}

impl EntrySource for EmptySource {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn stat(&self) -> SourceStat {
        SourceStat {
            size: 0,
            comp_size: 0,
            crc32: 0,
            method: METHOD_STORED,
            mtime: self.mtime,
        }
    }
}

enum PendingKind {
    Dir,
    File(Box<dyn EntrySource>),
}

struct PendingEntry {
    name: String,
    mtime: i64,
    encrypt: bool,
    kind: PendingKind,
}

// ---------------------------------------------------------------------------
// archive handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing archive, reading only.
    ReadOnly,
    /// Open an existing archive for mutation, or start a new one.
    Create,
}

pub struct Archive {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    entries: Vec<CdEntry>,
    pending: Vec<PendingEntry>,
    password: Option<String>,
    read_only: bool,
    dirty: bool,
    closed: bool,
}

impl Archive {
    /// Open an archive. In `Create` mode a missing file yields an empty
    /// archive that materializes on `close`.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode, password: Option<&str>) -> Result<Archive> {
        let path = path.as_ref().to_path_buf();
        // a zero-length file counts as an empty, not-yet-written archive
        let exists = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if mode == OpenMode::ReadOnly && !exists {
            return Err(ZipError::FileNotFound(path.display().to_string()));
        }

        let (reader, entries) = if exists {
            let mut reader = BufReader::new(File::open(&path)?);
            let entries = read_central_directory(&mut reader)?;
            (Some(reader), entries)
        } else {
            (None, Vec::new())
        };

        Ok(Archive {
            path,
            reader,
            entries,
            pending: Vec::new(),
            password: password.map(str::to_string),
            read_only: mode == OpenMode::ReadOnly,
            dirty: false,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_default_password(&mut self, password: &str) {
        self.password = Some(password.to_string());
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Number of committed entries (staged additions not included).
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn stat_at(&self, index: usize) -> Result<EntryStat> {
        let e = self
            .entries
            .get(index)
            .filter(|e| !e.deleted)
            .ok_or_else(|| ZipError::EntryNotFound(format!("#{}", index)))?;
        Ok(EntryStat {
            index,
            name: e.name.clone(),
            size: e.size,
            comp_size: e.comp_size,
            mtime: dos_to_unix(e.dos_time, e.dos_date),
            crc32: e.crc32,
            encrypted: e.aes.is_some(),
        })
    }

    /// Index of the first live entry with this exact name.
    pub fn locate(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.deleted && e.name == name)
    }

    /// Entries whose names begin with `prefix`; `recursive` includes
    /// entries in subdirectories of the prefix.
    pub fn list(&self, prefix: &str, recursive: bool) -> Vec<EntryStat> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.deleted && e.name.starts_with(prefix) && e.name.len() > prefix.len())
            .filter(|(_, e)| {
                if recursive {
                    return true;
                }
                let rest = &e.name[prefix.len()..];
                let rest = rest.strip_suffix('/').unwrap_or(rest);
                !rest.contains('/')
            })
            .map(|(i, _)| self.stat_at(i).expect("live entry"))
            .collect()
    }

    // -- mutation ----------------------------------------------------------

    fn check_mutable(&self) -> Result<()> {
        if self.read_only {
            return Err(ZipError::InvalidArgument("archive is read-only"));
        }
        if self.closed {
            return Err(ZipError::InvalidArgument("archive is closed"));
        }
        Ok(())
    }

    /// Rename a committed entry. Renaming an entry to its current name is
    /// a no-op.
    pub fn rename(&mut self, index: usize, new_name: &str) -> Result<()> {
        self.check_mutable()?;
        let current = self
            .entries
            .get(index)
            .filter(|e| !e.deleted)
            .ok_or_else(|| ZipError::EntryNotFound(format!("#{}", index)))?
            .name
            .clone();
        if current == new_name {
            return Ok(());
        }
        if self.locate(new_name).is_some() {
            return Err(ZipError::EntryAlreadyExists(new_name.to_string()));
        }
        self.entries[index].name = new_name.to_string();
        self.dirty = true;
        Ok(())
    }

    pub fn delete(&mut self, index: usize) -> Result<()> {
        self.check_mutable()?;
        let e = self
            .entries
            .get_mut(index)
            .filter(|e| !e.deleted)
            .ok_or_else(|| ZipError::EntryNotFound(format!("#{}", index)))?;
        e.deleted = true;
        self.dirty = true;
        Ok(())
    }

    fn name_in_use(&self, name: &str) -> bool {
        self.locate(name).is_some() || self.pending.iter().any(|p| p.name == name)
    }

    /// Stage a directory entry. Returns the entry's staged index.
    pub fn add_dir(&mut self, relpath: &str, mtime: i64) -> Result<usize> {
        self.check_mutable()?;
        let name = if relpath.ends_with('/') {
            relpath.to_string()
        } else {
            format!("{}/", relpath)
        };
        if self.name_in_use(&name) {
            return Err(ZipError::EntryAlreadyExists(name));
        }
        self.pending.push(PendingEntry {
            name,
            mtime,
            encrypt: false,
            kind: PendingKind::Dir,
        });
        self.dirty = true;
        Ok(self.entries.len() + self.pending.len() - 1)
    }

    /// Stage a file entry fed by `source`. With `overwrite`, an existing
    /// committed entry of the same name is replaced. Returns the staged
    /// index, valid for [`Archive::set_entry_encryption`] and
    /// [`Archive::set_entry_mtime`].
    pub fn add_file(
        &mut self,
        relpath: &str,
        source: Box<dyn EntrySource>,
        overwrite: bool,
    ) -> Result<usize> {
        self.check_mutable()?;
        if let Some(existing) = self.locate(relpath) {
            if !overwrite {
                return Err(ZipError::EntryAlreadyExists(relpath.to_string()));
            }
            self.entries[existing].deleted = true;
        }
        if self.pending.iter().any(|p| p.name == relpath) {
            return Err(ZipError::EntryAlreadyExists(relpath.to_string()));
        }
        let mtime = source.stat().mtime;
        self.pending.push(PendingEntry {
            name: relpath.to_string(),
            mtime,
            encrypt: false,
            kind: PendingKind::File(source),
        });
        self.dirty = true;
        Ok(self.entries.len() + self.pending.len() - 1)
    }

    /// Mark a staged entry for AES-256 encryption using the default
    /// password.
    pub fn set_entry_encryption(&mut self, index: usize) -> Result<()> {
        self.check_mutable()?;
        if self.password.is_none() {
            return Err(ZipError::EncryptionError("no default password set".to_string()));
        }
        let pos = index
            .checked_sub(self.entries.len())
            .ok_or(ZipError::InvalidArgument("encryption applies to staged entries"))?;
        let p = self
            .pending
            .get_mut(pos)
            .ok_or_else(|| ZipError::EntryNotFound(format!("#{}", index)))?;
        p.encrypt = true;
        Ok(())
    }

    /// Override a staged entry's modification time.
    pub fn set_entry_mtime(&mut self, index: usize, mtime: i64) -> Result<()> {
        self.check_mutable()?;
        let pos = index
            .checked_sub(self.entries.len())
            .ok_or(ZipError::InvalidArgument("mtime override applies to staged entries"))?;
        let p = self
            .pending
            .get_mut(pos)
            .ok_or_else(|| ZipError::EntryNotFound(format!("#{}", index)))?;
        p.mtime = mtime;
        Ok(())
    }

    /// Drop staged changes without touching the file. Sources are released.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.dirty = false;
        self.closed = true;
    }

    /// Commit staged changes and close the handle.
    ///
    /// Streams every pending source, copies retained entries raw, writes
    /// the new central directory to a sibling temp file and atomically
    /// renames it over the archive. Without staged changes this just
    /// closes. On failure the staged sources are *kept* so the caller can
    /// first quiesce its workers, then call [`Archive::discard`].
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.dirty {
            self.closed = true;
            self.reader = None;
            return Ok(());
        }
        self.check_mutable()?;

        let tmp_path = self.path.with_extension("ziptmp~");
        let commit = self.commit(&tmp_path);
        match commit {
            Ok(()) => {
                // release the read handle before replacing the file
                self.reader = None;
                fs::rename(&tmp_path, &self.path)?;
                self.pending.clear();
                self.dirty = false;
                self.closed = true;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn commit(&mut self, tmp_path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(tmp_path)?);
        let mut records: Vec<CdEntry> = Vec::with_capacity(
            self.entries.iter().filter(|e| !e.deleted).count() + self.pending.len(),
        );
        let mut pos: u64 = 0;

        // retained committed entries, payload copied raw
        let retained: Vec<CdEntry> = self
            .entries
            .iter()
            .filter(|e| !e.deleted)
            .cloned()
            .collect();
        for entry in retained {
            let reader = self
                .reader
                .as_mut()
                .ok_or_else(|| ZipError::Internal("retained entry without backing file".into()))?;
            seek_entry_data(reader, entry.offset)?;

            let mut rec = entry.clone();
            rec.offset = pos;
            pos += write_local_header(&mut out, &rec, false)?;
            pos += copy_bytes(reader, &mut out, entry.comp_size)?;
            records.push(rec);
        }

        // staged entries, pulled from their sources
        let password = self.password.clone();
        for p in &mut self.pending {
            let (dos_time, dos_date) = unix_to_dos(p.mtime);
            let name = p.name.clone();
            let encrypt = p.encrypt;
            match &mut p.kind {
                PendingKind::Dir => {
                    let rec = CdEntry {
                        name,
                        crc32: 0,
                        comp_size: 0,
                        size: 0,
                        method: METHOD_STORED,
                        dos_time,
                        dos_date,
                        offset: pos,
                        aes: None,
                        deleted: false,
                    };
                    pos += write_local_header(&mut out, &rec, false)?;
                    records.push(rec);
                }
                PendingKind::File(source) => {
                    let rec = write_source_entry(
                        &mut out,
                        &mut pos,
                        &name,
                        encrypt,
                        source.as_mut(),
                        dos_time,
                        dos_date,
                        password.as_deref(),
                    )?;
                    records.push(rec);
                }
            }
        }

        write_central_directory(&mut out, &records, pos)?;
        out.flush()?;
        Ok(())
    }

    // -- entry streams -----------------------------------------------------

    /// Open a decompressing (and decrypting) reader over a committed
    /// entry's content.
    pub fn open_entry_stream(&mut self, index: usize) -> Result<EntryReader<'_>> {
        let entry = self
            .entries
            .get(index)
            .filter(|e| !e.deleted)
            .cloned()
            .ok_or_else(|| ZipError::EntryNotFound(format!("#{}", index)))?;
        let password = self.password.clone();
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ZipError::Internal("archive has no backing file".into()))?;

        seek_entry_data(reader, entry.offset)?;

        let (method, payload): (u16, PayloadReader<'_>) = match entry.aes {
            Some(aes) => {
                let password = password.ok_or(ZipError::IncorrectPassword)?;
                let mut salt = [0u8; SALT_LEN];
                reader.read_exact(&mut salt)?;
                let mut verifier = [0u8; VERIFY_LEN];
                reader.read_exact(&mut verifier)?;
                let decryptor = EntryDecryptor::new(&password, &salt, &verifier)?;
                let overhead = (SALT_LEN + VERIFY_LEN + AUTH_CODE_LEN) as u64;
                let ciphertext_len = entry.comp_size.saturating_sub(overhead);
                (
                    aes.method,
                    PayloadReader::Aes(AesPayloadReader {
                        file: reader,
                        remaining: ciphertext_len,
                        decryptor: Some(decryptor),
                    }),
                )
            }
            None => (
                entry.method,
                PayloadReader::Plain(reader.take(entry.comp_size)),
            ),
        };

        let inner = match method {
            METHOD_DEFLATE => InnerReader::Deflate(DeflateDecoder::new(payload)),
            METHOD_STORED => InnerReader::Stored(payload),
            other => return Err(ZipError::UnsupportedCompression(other)),
        };
        Ok(EntryReader { inner })
    }

    pub fn open_entry_stream_by_name(&mut self, name: &str) -> Result<EntryReader<'_>> {
        let index = self
            .locate(name)
            .ok_or_else(|| ZipError::EntryNotFound(name.to_string()))?;
        self.open_entry_stream(index)
    }
}

// ---------------------------------------------------------------------------
// entry payload readers
// ---------------------------------------------------------------------------

/// Decrypts the AES-CTR payload and checks the trailing auth code once the
/// ciphertext is exhausted.
struct AesPayloadReader<'a> {
    file: &'a mut BufReader<File>,
    remaining: u64,
    decryptor: Option<EntryDecryptor>,
}

impl Read for AesPayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            if let Some(decryptor) = self.decryptor.take() {
                let mut auth = [0u8; AUTH_CODE_LEN];
                self.file.read_exact(&mut auth)?;
                decryptor
                    .verify_auth_code(&auth)
                    .map_err(|e| io::Error::other(e.to_string()))?;
            }
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "encrypted payload truncated",
            ));
        }
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.decrypt(&mut buf[..n]);
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

enum PayloadReader<'a> {
    Plain(io::Take<&'a mut BufReader<File>>),
    Aes(AesPayloadReader<'a>),
}

impl Read for PayloadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadReader::Plain(r) => r.read(buf),
            PayloadReader::Aes(r) => r.read(buf),
        }
    }
}

enum InnerReader<'a> {
    Stored(PayloadReader<'a>),
    Deflate(DeflateDecoder<PayloadReader<'a>>),
}

/// Decompressed content stream of one archive entry.
pub struct EntryReader<'a> {
    inner: InnerReader<'a>,
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            InnerReader::Stored(r) => r.read(buf),
            InnerReader::Deflate(r) => r.read(buf),
        }
    }
}

// ---------------------------------------------------------------------------
// wire format: reading
// ---------------------------------------------------------------------------

/// Skip a local header, returning the offset of the entry payload.
fn seek_entry_data(reader: &mut BufReader<File>, offset: u64) -> Result<u64> {
    reader.seek(SeekFrom::Start(offset))?;
    let sig = read_u32(reader)?;
    if sig != LOCAL_HEADER_SIG {
        return Err(ZipError::InvalidFormat(
            "invalid local file header signature".to_string(),
        ));
    }
    reader.seek(SeekFrom::Current(22))?;
    let name_len = read_u16(reader)? as i64;
    let extra_len = read_u16(reader)? as i64;
    Ok(reader.seek(SeekFrom::Current(name_len + extra_len))?)
}

/// Scan backwards for the end-of-central-directory record.
fn find_eocd(file: &mut BufReader<File>) -> Result<u64> {
    let file_size = file.seek(SeekFrom::End(0))?;
    // EOCD is at least 22 bytes; comment may pad up to 65535 more
    let search_start = file_size.saturating_sub(65557);
    file.seek(SeekFrom::Start(search_start))?;

    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    for i in (0..buffer.len().saturating_sub(3)).rev() {
        if buffer[i] == 0x50 && buffer[i + 1] == 0x4b && buffer[i + 2] == 0x05 && buffer[i + 3] == 0x06
        {
            return Ok(search_start + i as u64);
        }
    }
    Err(ZipError::InvalidFormat(
        "end of central directory not found".to_string(),
    ))
}

/// Read the ZIP64 EOCD record when the classic one carries placeholders.
fn read_zip64_eocd(file: &mut BufReader<File>, eocd_offset: u64) -> Result<(u64, u64)> {
    // locator sits directly before the classic EOCD
    let locator_offset = eocd_offset
        .checked_sub(20)
        .ok_or_else(|| ZipError::InvalidFormat("ZIP64 EOCD locator not found".to_string()))?;
    file.seek(SeekFrom::Start(locator_offset))?;
    if read_u32(file)? != ZIP64_EOCD_LOCATOR_SIG {
        return Err(ZipError::InvalidFormat(
            "ZIP64 EOCD locator not found".to_string(),
        ));
    }
    file.seek(SeekFrom::Current(4))?; // disk number
    let zip64_eocd_offset = read_u64(file)?;

    file.seek(SeekFrom::Start(zip64_eocd_offset))?;
    if read_u32(file)? != ZIP64_EOCD_SIG {
        return Err(ZipError::InvalidFormat(
            "invalid ZIP64 EOCD signature".to_string(),
        ));
    }
    file.seek(SeekFrom::Current(8 + 2 + 2 + 4 + 4))?; // record size, versions, disks
    let total_entries = read_u64(file)?;
    let _total_entries_all_disks = read_u64(file)?;
    let _cd_size = read_u64(file)?;
    let cd_offset = read_u64(file)?;
    Ok((total_entries, cd_offset))
}

fn read_central_directory(file: &mut BufReader<File>) -> Result<Vec<CdEntry>> {
    let eocd_offset = find_eocd(file)?;
    file.seek(SeekFrom::Start(eocd_offset + 4))?;
    file.seek(SeekFrom::Current(4))?; // disk numbers
    let _entries_on_disk = read_u16(file)?;
    let total_entries_16 = read_u16(file)?;
    let cd_size_32 = read_u32(file)?;
    let cd_offset_32 = read_u32(file)?;

    let (total_entries, cd_offset) =
        if total_entries_16 == 0xFFFF || cd_size_32 == 0xFFFF_FFFF || cd_offset_32 == 0xFFFF_FFFF {
            let (n, off) = read_zip64_eocd(file, eocd_offset)?;
            (n as usize, off)
        } else {
            (total_entries_16 as usize, cd_offset_32 as u64)
        };

    file.seek(SeekFrom::Start(cd_offset))?;
    let mut entries = Vec::with_capacity(total_entries);
    for _ in 0..total_entries {
        let sig = read_u32(file)?;
        if sig != CENTRAL_DIR_SIG {
            break;
        }
        file.seek(SeekFrom::Current(6))?; // versions, flags
        let method = read_u16(file)?;
        let dos_time = read_u16(file)?;
        let dos_date = read_u16(file)?;
        let crc32 = read_u32(file)?;
        let comp_size_32 = read_u32(file)? as u64;
        let size_32 = read_u32(file)? as u64;
        let name_len = read_u16(file)? as usize;
        let extra_len = read_u16(file)? as usize;
        let comment_len = read_u16(file)? as usize;
        file.seek(SeekFrom::Current(8))?; // disk, attributes
        let offset_32 = read_u32(file)? as u64;

        let mut name_buf = vec![0u8; name_len];
        file.read_exact(&mut name_buf)?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        let mut extra_buf = vec![0u8; extra_len];
        file.read_exact(&mut extra_buf)?;
        if comment_len > 0 {
            file.seek(SeekFrom::Current(comment_len as i64))?;
        }

        let mut comp_size = comp_size_32;
        let mut size = size_32;
        let mut offset = offset_32;
        let mut aes = None;

        let mut i = 0usize;
        while i + 4 <= extra_buf.len() {
            let id = u16::from_le_bytes([extra_buf[i], extra_buf[i + 1]]);
            let data_len = u16::from_le_bytes([extra_buf[i + 2], extra_buf[i + 3]]) as usize;
            i += 4;
            if i + data_len > extra_buf.len() {
                break;
            }
            let data = &extra_buf[i..i + data_len];
            match id {
                ZIP64_EXTRA_ID => {
                    // values appear in order for each 0xFFFFFFFF placeholder
                    let mut cursor = 0usize;
                    let mut take = |present: bool, slot: &mut u64| {
                        if present && cursor + 8 <= data.len() {
                            *slot = u64::from_le_bytes(
                                data[cursor..cursor + 8].try_into().unwrap(),
                            );
                            cursor += 8;
                        }
                    };
                    take(size_32 == 0xFFFF_FFFFu64, &mut size);
                    take(comp_size_32 == 0xFFFF_FFFFu64, &mut comp_size);
                    take(offset_32 == 0xFFFF_FFFFu64, &mut offset);
                }
                AES_EXTRA_ID => {
                    if data.len() >= 7 {
                        aes = Some(AesExtra {
                            version: u16::from_le_bytes([data[0], data[1]]),
                            strength: data[4],
                            method: u16::from_le_bytes([data[5], data[6]]),
                        });
                    }
                }
                _ => {}
            }
            i += data_len;
        }

        entries.push(CdEntry {
            name,
            crc32,
            comp_size,
            size,
            method,
            dos_time,
            dos_date,
            offset,
            aes,
            deleted: false,
        });
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// wire format: writing
// ---------------------------------------------------------------------------

fn entry_flags(rec: &CdEntry, streamed: bool) -> u16 {
    let mut flags = FLAG_UTF8;
    if rec.aes.is_some() {
        flags |= FLAG_ENCRYPTED;
    }
    if streamed {
        flags |= FLAG_DATA_DESCRIPTOR;
    }
    flags
}

fn aes_extra_bytes(aes: &AesExtra) -> [u8; 11] {
    let mut buf = [0u8; 11];
    buf[0..2].copy_from_slice(&AES_EXTRA_ID.to_le_bytes());
    buf[2..4].copy_from_slice(&7u16.to_le_bytes());
    buf[4..6].copy_from_slice(&aes.version.to_le_bytes());
    buf[6..8].copy_from_slice(b"AE");
    buf[8] = aes.strength;
    buf[9..11].copy_from_slice(&aes.method.to_le_bytes());
    buf
}

/// Write a local header; returns the number of bytes written. With
/// `streamed`, sizes and CRC are zero placeholders finalized by a data
/// descriptor after the payload.
fn write_local_header<W: Write>(out: &mut W, rec: &CdEntry, streamed: bool) -> Result<u64> {
    let extra: Vec<u8> = match &rec.aes {
        Some(aes) => aes_extra_bytes(aes).to_vec(),
        None => Vec::new(),
    };

    w32(out, LOCAL_HEADER_SIG)?;
    w16(out, 20)?; // version needed
    w16(out, entry_flags(rec, streamed))?;
    w16(out, rec.method)?;
    w16(out, rec.dos_time)?;
    w16(out, rec.dos_date)?;
    if streamed {
        w32(out, 0)?;
        w32(out, 0)?;
        w32(out, 0)?;
    } else {
        w32(out, rec.crc32)?;
        w32(out, rec.comp_size.min(0xFFFF_FFFF) as u32)?;
        w32(out, rec.size.min(0xFFFF_FFFF) as u32)?;
    }
    w16(out, rec.name.len() as u16)?;
    w16(out, extra.len() as u16)?;
    out.write_all(rec.name.as_bytes())?;
    out.write_all(&extra)?;
    Ok(30 + rec.name.len() as u64 + extra.len() as u64)
}

fn write_data_descriptor<W: Write>(out: &mut W, rec: &CdEntry) -> Result<u64> {
    w32(out, DATA_DESCRIPTOR_SIG)?;
    w32(out, rec.crc32)?;
    if rec.comp_size > u32::MAX as u64 || rec.size > u32::MAX as u64 {
        w64(out, rec.comp_size)?;
        w64(out, rec.size)?;
        Ok(4 + 4 + 16)
    } else {
        w32(out, rec.comp_size as u32)?;
        w32(out, rec.size as u32)?;
        Ok(4 + 4 + 8)
    }
}

fn copy_bytes<R: Read, W: Write>(reader: &mut R, out: &mut W, len: u64) -> Result<u64> {
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut left = len;
    while left > 0 {
        let want = (buf.len() as u64).min(left) as usize;
        reader.read_exact(&mut buf[..want])?;
        out.write_all(&buf[..want])?;
        left -= want as u64;
    }
    Ok(len)
}

/// Drain one staged source into the archive, wrapping it in AE-2 framing
/// when the entry is marked for encryption. Returns the central-directory
/// record for the written entry.
#[allow(clippy::too_many_arguments)]
fn write_source_entry<W: Write>(
    out: &mut W,
    pos: &mut u64,
    name: &str,
    encrypt: bool,
    source: &mut dyn EntrySource,
    dos_time: u16,
    dos_date: u16,
    password: Option<&str>,
) -> Result<CdEntry> {
    source.open()?;
    let pre_stat = source.stat();

    let aes = if encrypt {
        Some(AesExtra {
            version: 2, // AE-2
            strength: WINZIP_AES256,
            method: pre_stat.method,
        })
    } else {
        None
    };

    let mut rec = CdEntry {
        name: name.to_string(),
        crc32: 0,
        comp_size: 0,
        size: 0,
        method: if aes.is_some() { METHOD_AES } else { pre_stat.method },
        dos_time,
        dos_date,
        offset: *pos,
        aes,
        deleted: false,
    };
    *pos += write_local_header(out, &rec, true)?;

    let mut encryptor = match encrypt {
        true => {
            let password = password
                .ok_or_else(|| ZipError::EncryptionError("no default password set".to_string()))?;
            let enc = EntryEncryptor::new(password)?;
            out.write_all(enc.salt())?;
            out.write_all(&enc.password_verifier())?;
            Some(enc)
        }
        false => None,
    };

    let mut payload_len: u64 = 0;
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Some(enc) = encryptor.as_mut() {
            enc.encrypt(&mut buf[..n]);
        }
        out.write_all(&buf[..n])?;
        payload_len += n as u64;
    }
    source.close();

    let stat = source.stat();
    rec.size = stat.size;
    if let Some(enc) = encryptor {
        out.write_all(&enc.finalize())?;
        rec.comp_size = payload_len + (SALT_LEN + VERIFY_LEN + AUTH_CODE_LEN) as u64;
        rec.crc32 = 0; // AE-2 stores no CRC
    } else {
        rec.comp_size = payload_len;
        rec.crc32 = stat.crc32;
    }
    *pos += rec.comp_size;
    *pos += write_data_descriptor(out, &rec)?;
    Ok(rec)
}

fn write_central_directory<W: Write>(out: &mut W, records: &[CdEntry], cd_offset: u64) -> Result<()> {
    let mut cd_size: u64 = 0;
    for rec in records {
        let mut extra: Vec<u8> = Vec::new();

        let need_zip64 = rec.size > u32::MAX as u64
            || rec.comp_size > u32::MAX as u64
            || rec.offset > u32::MAX as u64;
        if need_zip64 {
            let mut data: Vec<u8> = Vec::new();
            if rec.size > u32::MAX as u64 {
                data.extend_from_slice(&rec.size.to_le_bytes());
            }
            if rec.comp_size > u32::MAX as u64 {
                data.extend_from_slice(&rec.comp_size.to_le_bytes());
            }
            if rec.offset > u32::MAX as u64 {
                data.extend_from_slice(&rec.offset.to_le_bytes());
            }
            extra.extend_from_slice(&ZIP64_EXTRA_ID.to_le_bytes());
            extra.extend_from_slice(&(data.len() as u16).to_le_bytes());
            extra.extend_from_slice(&data);
        }
        if let Some(aes) = &rec.aes {
            extra.extend_from_slice(&aes_extra_bytes(aes));
        }

        w32(out, CENTRAL_DIR_SIG)?;
        w16(out, 20)?; // version made by
        w16(out, 20)?; // version needed
        w16(out, entry_flags(rec, false))?;
        w16(out, rec.method)?;
        w16(out, rec.dos_time)?;
        w16(out, rec.dos_date)?;
        w32(out, rec.crc32)?;
        w32(out, rec.comp_size.min(0xFFFF_FFFF) as u32)?;
        w32(out, rec.size.min(0xFFFF_FFFF) as u32)?;
        w16(out, rec.name.len() as u16)?;
        w16(out, extra.len() as u16)?;
        w16(out, 0)?; // comment
        w16(out, 0)?; // disk number start
        w16(out, 0)?; // internal attributes
        w32(out, 0)?; // external attributes
        w32(out, rec.offset.min(0xFFFF_FFFF) as u32)?;
        out.write_all(rec.name.as_bytes())?;
        out.write_all(&extra)?;
        cd_size += 46 + rec.name.len() as u64 + extra.len() as u64;
    }

    let need_zip64 = records.len() > u16::MAX as usize
        || cd_size > u32::MAX as u64
        || cd_offset > u32::MAX as u64;

    if need_zip64 {
        let zip64_eocd_pos = cd_offset + cd_size;
        w32(out, ZIP64_EOCD_SIG)?;
        w64(out, 44)?; // remaining record size
        w16(out, 20)?;
        w16(out, 20)?;
        w32(out, 0)?;
        w32(out, 0)?;
        w64(out, records.len() as u64)?;
        w64(out, records.len() as u64)?;
        w64(out, cd_size)?;
        w64(out, cd_offset)?;

        w32(out, ZIP64_EOCD_LOCATOR_SIG)?;
        w32(out, 0)?;
        w64(out, zip64_eocd_pos)?;
        w32(out, 1)?;
    }

    w32(out, EOCD_SIG)?;
    w16(out, 0)?;
    w16(out, 0)?;
    let n16 = records.len().min(u16::MAX as usize) as u16;
    w16(out, n16)?;
    w16(out, n16)?;
    w32(out, cd_size.min(0xFFFF_FFFF) as u32)?;
    w32(out, cd_offset.min(0xFFFF_FFFF) as u32)?;
    w16(out, 0)?; // comment
    Ok(())
}

/// Validate that an entry name is safe to extract; used by every consumer
/// of untrusted archives.
pub fn check_entry_name(name: &str) -> Result<()> {
    if paths::is_malicious_path(name) {
        return Err(ZipError::MaliciousPath(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    /// A source yielding a pre-deflated payload, the shape the compress
    /// engine feeds the container.
    struct DeflatedSource {
        data: Vec<u8>,
        pos: usize,
        stat: SourceStat,
    }

    fn deflated_source(content: &[u8], mtime: i64) -> DeflatedSource {
        let mut comp = crate::codec::BlockCompressor::new(6);
        let mut data = Vec::new();
        comp.compress(content, &mut data, crate::codec::Flush::Finish)
            .unwrap();
        let comp_size = data.len() as u64;
        DeflatedSource {
            data,
            pos: 0,
            stat: SourceStat {
                size: content.len() as u64,
                comp_size,
                crc32: crc32fast::hash(content),
                method: METHOD_DEFLATE,
                mtime,
            },
        }
    }

    impl EntrySource for DeflatedSource {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn stat(&self) -> SourceStat {
            self.stat
        }
    }

    fn archive_with(entries: &[(&str, &[u8])]) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.zip");
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        for (name, content) in entries {
            if name.ends_with('/') {
                zip.add_dir(name, 1_700_000_000).unwrap();
            } else {
                zip.add_file(name, Box::new(deflated_source(content, 1_700_000_000)), true)
                    .unwrap();
            }
        }
        zip.close().unwrap();
        (dir, path)
    }

    fn read_all(zip: &mut Archive, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        zip.open_entry_stream_by_name(name)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn write_then_read_round_trip() {
        let (_dir, path) = archive_with(&[
            ("a/", b""),
            ("a/hello.txt", b"hello world"),
            ("a/big.bin", &[7u8; 100_000]),
        ]);

        let mut zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        assert_eq!(zip.num_entries(), 3);
        assert_eq!(read_all(&mut zip, "a/hello.txt"), b"hello world");
        assert_eq!(read_all(&mut zip, "a/big.bin"), vec![7u8; 100_000]);

        let stat = zip.stat_at(zip.locate("a/hello.txt").unwrap()).unwrap();
        assert_eq!(stat.size, 11);
        assert!(stat.comp_size > 0);
    }

    #[test]
    fn dir_entries_and_mtime() {
        let (_dir, path) = archive_with(&[("d/", b""), ("d/f.txt", b"x")]);
        let zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        let stat = zip.stat_at(zip.locate("d/").unwrap()).unwrap();
        assert!(stat.is_dir());
        // DOS time has 2-second granularity
        assert!((stat.mtime - 1_700_000_000).abs() <= 2);
    }

    #[test]
    fn duplicate_dir_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dup.zip");
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        zip.add_dir("d/", 0).unwrap();
        assert!(matches!(
            zip.add_dir("d/", 0),
            Err(ZipError::EntryAlreadyExists(_))
        ));
    }

    #[test]
    fn rename_and_delete_rewrite_archive() {
        let (_dir, path) = archive_with(&[("one.txt", b"1"), ("two.txt", b"22")]);

        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        let idx = zip.locate("one.txt").unwrap();
        zip.rename(idx, "renamed.txt").unwrap();
        zip.delete(zip.locate("two.txt").unwrap()).unwrap();
        zip.close().unwrap();

        let mut zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        assert_eq!(zip.num_entries(), 1);
        assert!(zip.locate("two.txt").is_none());
        assert_eq!(read_all(&mut zip, "renamed.txt"), b"1");
    }

    #[test]
    fn rename_to_self_is_noop() {
        let (_dir, path) = archive_with(&[("a.txt", b"a")]);
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        let idx = zip.locate("a.txt").unwrap();
        zip.rename(idx, "a.txt").unwrap();
        zip.close().unwrap();
        let zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        assert!(zip.locate("a.txt").is_some());
    }

    #[test]
    fn rename_collision_is_rejected() {
        let (_dir, path) = archive_with(&[("a.txt", b"a"), ("b.txt", b"b")]);
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        let idx = zip.locate("a.txt").unwrap();
        assert!(matches!(
            zip.rename(idx, "b.txt"),
            Err(ZipError::EntryAlreadyExists(_))
        ));
    }

    #[test]
    fn list_prefix_and_recursion() {
        let (_dir, path) = archive_with(&[
            ("d/", b""),
            ("d/a.txt", b"a"),
            ("d/sub/", b""),
            ("d/sub/b.txt", b"b"),
            ("top.txt", b"t"),
        ]);
        let zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();

        let all = zip.list("d/", true);
        assert_eq!(all.len(), 3);

        let shallow = zip.list("d/", false);
        let names: Vec<_> = shallow.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["d/a.txt", "d/sub/"]);

        let root = zip.list("", false);
        let names: Vec<_> = root.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["d/", "top.txt"]);
    }

    #[test]
    fn encrypted_entry_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.zip");
        let content = b"secret payload".repeat(1000);

        let mut zip = Archive::open(&path, OpenMode::Create, Some("p@ss")).unwrap();
        let idx = zip
            .add_file("s.bin", Box::new(deflated_source(&content, 0)), true)
            .unwrap();
        zip.set_entry_encryption(idx).unwrap();
        zip.close().unwrap();

        // without a password the stream refuses to open
        let mut zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        let stat = zip.stat_at(0).unwrap();
        assert!(stat.encrypted);
        assert!(matches!(
            zip.open_entry_stream(0),
            Err(ZipError::IncorrectPassword)
        ));

        // wrong password is caught by the verifier
        let mut zip = Archive::open(&path, OpenMode::ReadOnly, Some("nope")).unwrap();
        assert!(matches!(
            zip.open_entry_stream(0),
            Err(ZipError::IncorrectPassword)
        ));

        // correct password decrypts
        let mut zip = Archive::open(&path, OpenMode::ReadOnly, Some("p@ss")).unwrap();
        assert_eq!(read_all(&mut zip, "s.bin"), content);
    }

    #[test]
    fn add_file_overwrite_replaces_committed_entry() {
        let (_dir, path) = archive_with(&[("f.txt", b"old")]);
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        zip.add_file("f.txt", Box::new(deflated_source(b"new", 0)), true)
            .unwrap();
        zip.close().unwrap();

        let mut zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        assert_eq!(zip.num_entries(), 1);
        assert_eq!(read_all(&mut zip, "f.txt"), b"new");
    }

    #[test]
    fn discard_leaves_file_untouched() {
        let (_dir, path) = archive_with(&[("keep.txt", b"k")]);
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        zip.add_file("extra.txt", Box::new(deflated_source(b"x", 0)), true)
            .unwrap();
        zip.discard();

        let zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        assert_eq!(zip.num_entries(), 1);
        assert!(zip.locate("extra.txt").is_none());
    }

    #[test]
    fn staged_mtime_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mt.zip");
        let mut zip = Archive::open(&path, OpenMode::Create, None).unwrap();
        let idx = zip
            .add_file("f.txt", Box::new(deflated_source(b"f", 1_000_000_000)), true)
            .unwrap();
        zip.set_entry_mtime(idx, 1_700_000_000).unwrap();
        zip.close().unwrap();

        let zip = Archive::open(&path, OpenMode::ReadOnly, None).unwrap();
        let stat = zip.stat_at(0).unwrap();
        assert!((stat.mtime - 1_700_000_000).abs() <= 2);
    }

    #[test]
    fn dos_time_round_trip() {
        let t = 1_700_000_000i64;
        let (time, date) = unix_to_dos(t);
        let back = dos_to_unix(time, date);
        assert!((back - t).abs() <= 2);
    }

    #[test]
    fn pre_1980_clamps_to_dos_epoch() {
        let (time, date) = unix_to_dos(0);
        assert_eq!((time, date), (0, 0x21));
    }
}

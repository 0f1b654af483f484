// Single-file hash database: header, bucket table, and append-only record chains.
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{DB_FORMAT_VERSION, db_version_error, is_supported};
use crate::core::record::{RECORD_HEADER_LEN, RecordHeader, validate_key};

const MAGIC: [u8; 4] = *b"KVFB";
const ENDIANNESS_LE: u8 = 1;
const HEADER_SIZE: usize = 512;
const SLOT_LEN: u64 = 8;
const ITER_SLOT_BATCH: u64 = 1024;

pub const DEFAULT_BUCKET_COUNT: u64 = 8191;
pub const MAX_BUCKET_COUNT: u64 = 1 << 26;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DbHeader {
    pub bucket_count: u64,
    pub record_count: u64,
    pub bucket_offset: u64,
    pub data_end: u64,
}

impl DbHeader {
    fn new(bucket_count: u64) -> Self {
        let bucket_offset = HEADER_SIZE as u64;
        Self {
            bucket_count,
            record_count: 0,
            bucket_offset,
            data_end: bucket_offset + bucket_count * SLOT_LEN,
        }
    }

    pub fn data_start(&self) -> u64 {
        self.bucket_offset + self.bucket_count * SLOT_LEN
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&DB_FORMAT_VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;

        write_u64(&mut buf, 16, self.bucket_count);
        write_u64(&mut buf, 24, self.record_count);
        write_u64(&mut buf, 32, self.bucket_offset);
        write_u64(&mut buf, 40, self.data_end);

        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = read_u32(buf, 4);
        if !is_supported(version) {
            return Err(db_version_error(version));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        Ok(Self {
            bucket_count: read_u64(buf, 16),
            record_count: read_u64(buf, 24),
            bucket_offset: read_u64(buf, 32),
            data_end: read_u64(buf, 40),
        })
    }

    fn validate(&self, actual_file_size: u64) -> Result<(), Error> {
        if self.bucket_count == 0 || self.bucket_count > MAX_BUCKET_COUNT {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid bucket count"));
        }
        if self.bucket_offset != HEADER_SIZE as u64 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid bucket offset"));
        }
        if self.data_end < self.data_start() || self.data_end > actual_file_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("data bounds mismatch"));
        }
        Ok(())
    }
}

/// Open-time tuning. `bucket_hint` is the expected record count; it only
/// shapes the bucket table of a newly created file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DbOptions {
    pub bucket_hint: Option<u64>,
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tuned(expected_records: u64) -> Self {
        Self {
            bucket_hint: Some(expected_records),
        }
    }

    pub fn bucket_count(&self) -> Result<u64, Error> {
        match self.bucket_hint {
            Some(expected) => tuned_bucket_count(expected),
            None => Ok(DEFAULT_BUCKET_COUNT),
        }
    }
}

pub fn tuned_bucket_count(expected_records: u64) -> Result<u64, Error> {
    let doubled = expected_records
        .checked_mul(2)
        .filter(|count| *count <= MAX_BUCKET_COUNT)
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "cannot tune database for {expected_records} records"
                ))
                .with_hint(format!(
                    "Tuning supports at most {} records; drop -o to use the default layout.",
                    MAX_BUCKET_COUNT / 2
                ))
        })?;
    Ok(doubled.max(DEFAULT_BUCKET_COUNT))
}

pub struct Database {
    path: PathBuf,
    file: File,
    header: DbHeader,
}

impl Database {
    /// Opens `path` read-write, creating and initializing it when missing or empty.
    /// Holds an exclusive advisory lock until the handle is closed or dropped.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let bucket_count = options.bucket_count()?;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::io(err, &path).with_message("failed to open database file"))?;

        file.try_lock_exclusive().map_err(|err| {
            let err = Error::io(err, &path);
            if err.kind() == ErrorKind::Busy {
                err.with_message("database is locked by another process")
                    .with_hint("Wait for the other kvfiler run to finish.")
            } else {
                err.with_message("failed to lock database file")
            }
        })?;

        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::io(err, &path))?;

        let header = if actual_size == 0 {
            let header = DbHeader::new(bucket_count);
            file.set_len(header.data_start())
                .map_err(|err| Error::io(err, &path))?;
            write_header(&file, &header, &path)?;
            debug!(path = %path.display(), bucket_count, "created database");
            header
        } else {
            if actual_size < HEADER_SIZE as u64 {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("file too small for database header")
                    .with_path(&path));
            }
            let header = read_header(&file, &path)?;
            header
                .validate(actual_size)
                .map_err(|err| err.with_path(&path))?;
            if options.bucket_hint.is_some() && header.bucket_count != bucket_count {
                debug!(
                    path = %path.display(),
                    existing = header.bucket_count,
                    requested = bucket_count,
                    "existing database keeps its bucket layout"
                );
            }
            header
        };

        Ok(Self { path, file, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> DbHeader {
        self.header
    }

    pub fn len(&self) -> u64 {
        self.header.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.header.record_count == 0
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        validate_key(key)?;
        Ok(self.find(key)?.is_some())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        validate_key(key)?;
        let Some((offset, header)) = self.find(key)? else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("record not found")
                .with_key(String::from_utf8_lossy(key)));
        };
        self.read_value(offset, &header)
    }

    /// Appends a record and links it at the head of its bucket chain.
    /// An older record with the same key stays on disk but is shadowed.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        validate_key(key)?;
        let replaced = self.find(key)?.is_some();
        let slot = self.slot_offset(key);
        let head = self.read_slot(slot)?;

        let offset = self.header.data_end;
        let record = RecordHeader::new(key.len() as u32, value.len() as u64, head);
        let mut prefix = Vec::with_capacity(RECORD_HEADER_LEN + key.len());
        prefix.extend_from_slice(&record.encode());
        prefix.extend_from_slice(key);
        self.write_at(offset, &prefix)?;
        self.write_at(offset + prefix.len() as u64, value)?;

        let mut header = self.header;
        header.data_end = offset + record.total_len();
        if !replaced {
            header.record_count += 1;
        }
        // Header last: record_count only covers linked records.
        self.write_at(slot, &offset.to_le_bytes())?;
        write_header(&self.file, &header, &self.path)?;
        self.header = header;
        Ok(())
    }

    /// Yields every live key once, with its latest value, in bucket order.
    pub fn iter(&self) -> Records<'_> {
        Records {
            db: self,
            next_bucket: 0,
            slots: Vec::new(),
            slot_pos: 0,
            chain: 0,
            seen: HashSet::new(),
            done: false,
        }
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_all().map_err(|err| {
            Error::io(err, &self.path).with_message("failed to sync database")
        })
    }

    pub fn close(self) -> Result<(), Error> {
        self.sync()?;
        FileExt::unlock(&self.file).map_err(|err| {
            Error::io(err, &self.path).with_message("failed to unlock database")
        })
    }

    fn find(&self, key: &[u8]) -> Result<Option<(u64, RecordHeader)>, Error> {
        let mut offset = self.read_slot(self.slot_offset(key))?;
        while offset != 0 {
            let header = self.read_record_header(offset)?;
            if header.key_len as usize == key.len() {
                let stored = self.read_bytes(offset + RECORD_HEADER_LEN as u64, key.len())?;
                if stored == key {
                    return Ok(Some((offset, header)));
                }
            }
            offset = header.next;
        }
        Ok(None)
    }

    fn slot_offset(&self, key: &[u8]) -> u64 {
        self.header.bucket_offset + bucket_index(key, self.header.bucket_count) * SLOT_LEN
    }

    fn read_slot(&self, slot: u64) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_at(slot, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_slots(&self, first_bucket: u64, count: u64) -> Result<Vec<u64>, Error> {
        let start = self.header.bucket_offset + first_bucket * SLOT_LEN;
        let mut buf = vec![0u8; (count * SLOT_LEN) as usize];
        self.read_at(start, &mut buf)?;
        Ok(buf.chunks_exact(8).map(|chunk| read_u64(chunk, 0)).collect())
    }

    fn read_record_header(&self, offset: u64) -> Result<RecordHeader, Error> {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        self.read_at(offset, &mut buf)?;
        let header = RecordHeader::decode(&buf)
            .map_err(|err| err.with_offset(offset).with_path(&self.path))?;
        header
            .validate(offset, self.header.data_start(), self.header.data_end)
            .map_err(|err| err.with_path(&self.path))?;
        Ok(header)
    }

    fn read_value(&self, offset: u64, header: &RecordHeader) -> Result<Vec<u8>, Error> {
        let len = usize::try_from(header.value_len).map_err(|_| {
            Error::new(ErrorKind::Corrupt)
                .with_message("record value too large for this platform")
                .with_offset(offset)
        })?;
        let start = offset + RECORD_HEADER_LEN as u64 + header.key_len as u64;
        self.read_bytes(start, len)
    }

    fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| Error::io(err, &self.path).with_offset(offset))?;
        file.read_exact(buf)
            .map_err(|err| Error::io(err, &self.path).with_offset(offset))
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), Error> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| Error::io(err, &self.path).with_offset(offset))?;
        file.write_all(buf)
            .map_err(|err| Error::io(err, &self.path).with_offset(offset))
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct Records<'a> {
    db: &'a Database,
    next_bucket: u64,
    slots: Vec<u64>,
    slot_pos: usize,
    chain: u64,
    // Keys already yielded from the current chain; older duplicates are shadowed.
    seen: HashSet<Vec<u8>>,
    done: bool,
}

impl Records<'_> {
    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, Error> {
        loop {
            while self.chain != 0 {
                let offset = self.chain;
                let header = self.db.read_record_header(offset)?;
                self.chain = header.next;
                let key = self
                    .db
                    .read_bytes(offset + RECORD_HEADER_LEN as u64, header.key_len as usize)?;
                if !self.seen.insert(key.clone()) {
                    continue;
                }
                let value = self.db.read_value(offset, &header)?;
                return Ok(Some((key, value)));
            }

            self.seen.clear();
            match self.next_head()? {
                Some(head) => self.chain = head,
                None => return Ok(None),
            }
        }
    }

    fn next_head(&mut self) -> Result<Option<u64>, Error> {
        loop {
            if let Some(&head) = self.slots.get(self.slot_pos) {
                self.slot_pos += 1;
                if head != 0 {
                    return Ok(Some(head));
                }
                continue;
            }
            let bucket_count = self.db.header.bucket_count;
            if self.next_bucket >= bucket_count {
                return Ok(None);
            }
            let batch = ITER_SLOT_BATCH.min(bucket_count - self.next_bucket);
            self.slots = self.db.read_slots(self.next_bucket, batch)?;
            self.slot_pos = 0;
            self.next_bucket += batch;
        }
    }
}

impl Iterator for Records<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn bucket_index(key: &[u8], bucket_count: u64) -> u64 {
    let digest = Sha256::digest(key);
    read_u64(&digest, 0) % bucket_count
}

fn read_header(file: &File, path: &Path) -> Result<DbHeader, Error> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut file = file;
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::io(err, path))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::io(err, path))?;
    DbHeader::decode(&buf).map_err(|err| err.with_path(path))
}

fn write_header(file: &File, header: &DbHeader, path: &Path) -> Result<(), Error> {
    let buf = header.encode();
    let mut file = file;
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::io(err, path))?;
    file.write_all(&buf)
        .map_err(|err| Error::io(err, path))?;
    file.flush().map_err(|err| Error::io(err, path))?;
    Ok(())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_BUCKET_COUNT, Database, DbOptions, MAX_BUCKET_COUNT, tuned_bucket_count};
    use crate::core::error::ErrorKind;
    use std::collections::BTreeMap;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn create_put_and_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("archive.kvf");

        let mut db = Database::open(&path, DbOptions::new()).expect("create");
        assert!(db.is_empty());
        db.put(b"docs/a.txt", b"hi").expect("put a");
        db.put(b"docs/b.txt", b"bye").expect("put b");
        db.close().expect("close");

        let db = Database::open(&path, DbOptions::new()).expect("reopen");
        assert_eq!(db.len(), 2);
        assert_eq!(db.header().bucket_count, DEFAULT_BUCKET_COUNT);
        assert_eq!(db.get(b"docs/a.txt").expect("get a"), b"hi");
        assert_eq!(db.get(b"docs/b.txt").expect("get b"), b"bye");
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(dir.path().join("db.kvf"), DbOptions::new()).expect("open");
        let err = db.get(b"nope").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.key(), Some("nope"));
        assert!(!db.exists(b"nope").expect("exists"));
    }

    #[test]
    fn zero_length_value_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = Database::open(dir.path().join("db.kvf"), DbOptions::new()).expect("open");
        db.put(b"empty.txt", b"").expect("put");
        assert!(db.exists(b"empty.txt").expect("exists"));
        assert_eq!(db.get(b"empty.txt").expect("get"), Vec::<u8>::new());
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn overwrite_shadows_previous_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = Database::open(dir.path().join("db.kvf"), DbOptions::new()).expect("open");
        db.put(b"k", b"first").expect("put");
        db.put(b"k", b"second").expect("put");
        assert_eq!(db.get(b"k").expect("get"), b"second");
        assert_eq!(db.len(), 1);

        let records = db.iter().collect::<Result<Vec<_>, _>>().expect("iter");
        assert_eq!(records, vec![(b"k".to_vec(), b"second".to_vec())]);
    }

    #[test]
    fn iter_yields_every_key_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut db = Database::open(dir.path().join("db.kvf"), DbOptions::new()).expect("open");
        let mut expected = BTreeMap::new();
        for i in 0..200u32 {
            let key = format!("file-{i}");
            let value = format!("v{i}").into_bytes();
            db.put(key.as_bytes(), &value).expect("put");
            expected.insert(key.into_bytes(), value);
        }
        db.put(b"file-7", b"updated").expect("overwrite");
        expected.insert(b"file-7".to_vec(), b"updated".to_vec());

        let actual = db
            .iter()
            .collect::<Result<BTreeMap<_, _>, _>>()
            .expect("iter");
        assert_eq!(actual, expected);
        assert_eq!(db.len(), 200);
    }

    #[test]
    fn record_count_matches_reachable_records_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.kvf");
        let mut db = Database::open(&path, DbOptions::tuned(1)).expect("open");
        for key in ["a", "b", "a", "c", "b"] {
            db.put(key.as_bytes(), key.as_bytes()).expect("put");
        }
        assert!(db.put(b"", b"rejected").is_err());
        db.close().expect("close");

        let db = Database::open(&path, DbOptions::new()).expect("reopen");
        let reachable = db.iter().collect::<Result<Vec<_>, _>>().expect("iter");
        assert_eq!(db.len(), 3);
        assert_eq!(reachable.len() as u64, db.len());
    }

    #[test]
    fn tuning_applies_only_on_create() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.kvf");
        let db = Database::open(&path, DbOptions::tuned(10_000)).expect("create tuned");
        assert_eq!(db.header().bucket_count, 20_000);
        drop(db);

        let db = Database::open(&path, DbOptions::tuned(50_000)).expect("reopen");
        assert_eq!(db.header().bucket_count, 20_000);
    }

    #[test]
    fn tuned_bucket_count_has_floor_and_ceiling() {
        assert_eq!(tuned_bucket_count(0).expect("zero"), DEFAULT_BUCKET_COUNT);
        assert_eq!(tuned_bucket_count(5).expect("small"), DEFAULT_BUCKET_COUNT);
        let err = tuned_bucket_count(MAX_BUCKET_COUNT).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = tuned_bucket_count(u64::MAX).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn failed_tuning_does_not_create_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.kvf");
        let result = Database::open(&path, DbOptions::tuned(MAX_BUCKET_COUNT));
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.kvf");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(&path)
            .expect("create");
        file.set_len(64 * 1024).expect("len");
        file.seek(SeekFrom::Start(0)).expect("seek");
        file.write_all(b"NOPE").expect("write");
        file.flush().expect("flush");
        drop(file);

        match Database::open(&path, DbOptions::new()) {
            Ok(_) => panic!("expected corrupt header error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Corrupt),
        }
    }

    #[test]
    fn tiny_file_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.kvf");
        std::fs::write(&path, b"short").expect("write");
        let err = match Database::open(&path, DbOptions::new()) {
            Ok(_) => panic!("expected corrupt error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn second_open_is_busy_until_first_closes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.kvf");
        let first = Database::open(&path, DbOptions::new()).expect("first");

        match Database::open(&path, DbOptions::new()) {
            Ok(_) => panic!("expected busy error"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Busy),
        }

        first.close().expect("close");
        Database::open(&path, DbOptions::new()).expect("reopen after close");
    }
}

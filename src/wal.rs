use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest frame replay will read. A full user record is far below this;
/// a bigger length prefix can only come from a torn or corrupt tail.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode one event as `[u32 len][bincode payload][u32 crc32]`, little-endian.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "WAL frame too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` on a clean or partial EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the next frame. `None` marks the end of the usable log: EOF, a torn
/// tail, an oversized length, a CRC mismatch or an undecodable payload.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, 8 + len as u64)))
}

/// Append-only write-ahead log of user events.
///
/// A crash can leave a torn last frame; replay stops at the first frame that
/// fails its length or CRC check and everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Length of the log once every buffered frame is flushed.
    len: u64,
    appends_since_compact: u64,
    /// Set when a rollback could not restore the file; every later append fails.
    failed: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

/// Position to roll back to if a batch cannot be made durable.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    len: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            len,
            appends_since_compact: 0,
            failed: false,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        let mut frame = Vec::new();
        write_frame(&mut frame, event)?;
        #[cfg(test)]
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                self.writer.write_all(&frame[..frame.len() / 2])?;
                return Err(io::Error::other("injected write failure"));
            }
            Some(n) => self.fail_after = Some(n - 1),
            None => {}
        }
        self.writer.write_all(&frame)?;
        self.len += frame.len() as u64;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.failed {
            return Err(io::Error::other("WAL is unusable after a failed rollback"));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.len,
            appends_since_compact: self.appends_since_compact,
        }
    }

    /// Discard everything written or buffered since `checkpoint`: unflushed
    /// bytes are dropped and the file is truncated back to its old length.
    /// If that fails the WAL refuses all further appends.
    pub fn rollback(&mut self, checkpoint: Checkpoint) -> io::Result<()> {
        let result = self.truncate_to(checkpoint.len);
        if result.is_err() {
            self.failed = true;
        }
        self.len = checkpoint.len;
        self.appends_since_compact = checkpoint.appends_since_compact;
        result
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        let reopened = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(reopened));
        // into_parts hands back the file without flushing the buffer.
        let (file, _unflushed) = old.into_parts();
        file.set_len(len)?;
        file.sync_all()
    }

    /// Let `successes` appends through, then tear the next frame half way
    /// and fail it.
    #[cfg(test)]
    pub fn fail_after(&mut self, successes: usize) {
        self.fail_after = Some(successes);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a compacted log to the temp file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::tmp_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every valid event from `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Replay `path`, cut off anything after the last valid frame and open
    /// the log for appends. New frames never land behind a torn tail.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::scan(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                "truncating {} trailing bytes from {}",
                meta.len() - valid_len,
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }

    /// Valid events and the byte length they occupy.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        while let Some((event, frame_len)) = read_frame(&mut reader)? {
            events.push(event);
            valid_len += frame_len;
        }
        Ok((events, valid_len))
    }
}

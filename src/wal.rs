use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Largest payload a single frame may claim. A length prefix above this is
/// treated as a torn write rather than allocated.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame and return its size on disk.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

enum Frame {
    /// An intact event and the number of bytes its frame took.
    Event(Event, u64),
    /// Clean end of file.
    End,
    /// Truncated or corrupt tail starting at this frame.
    Torn(&'static str),
}

/// Fill `buf` completely. `Ok(false)` on EOF before the first byte,
/// `Err(UnexpectedEof)` on EOF part-way through.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    match read_full(reader, &mut len_buf) {
        Ok(true) => {}
        Ok(false) => return Ok(Frame::End),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(Frame::Torn("short length prefix"));
        }
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::Torn("implausible frame length"));
    }

    let mut body = vec![0u8; len + 4];
    match read_full(reader, &mut body) {
        Ok(true) => {}
        Ok(false) => return Ok(Frame::Torn("short frame body")),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(Frame::Torn("short frame body"));
        }
        Err(e) => return Err(e),
    }
    let (payload, crc_bytes) = body.split_at(len);
    let mut crc_buf = [0u8; 4];
    crc_buf.copy_from_slice(crc_bytes);
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(payload) {
        return Ok(Frame::Torn("checksum mismatch"));
    }
    match bincode::deserialize::<Event>(payload) {
        Ok(event) => Ok(Frame::Event(event, 8 + len as u64)),
        Err(_) => Ok(Frame::Torn("undecodable payload")),
    }
}

/// Append-only write-ahead log of committed events.
///
/// Frame layout: `[u32 le: len][bincode Event][u32 le: crc32 of payload]`.
/// A torn tail left by a crash is cut off when the log is opened, so new
/// frames always follow the last intact one.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by the last successful `flush_sync`.
    synced_len: u64,
    pending_len: u64,
    pending_appends: u64,
    appends_since_compact: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::recover(path).map(|(wal, _)| wal)
    }

    /// Replay the log, truncate anything behind the last intact frame, and
    /// open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }
        let (events, intact_len) = Self::scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > intact_len {
            file.set_len(intact_len)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = on_disk - intact_len,
                "truncated torn WAL tail"
            );
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len: intact_len,
            pending_len: 0,
            pending_appends: 0,
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    /// Append and fsync one event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.pending_len += write_frame(&mut self.writer, event)?;
        self.pending_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len += self.pending_len;
        self.appends_since_compact += self.pending_appends;
        self.pending_len = 0;
        self.pending_appends = 0;
        Ok(())
    }

    /// Throw away everything appended since the last successful
    /// `flush_sync`, including bytes a failed flush already pushed to disk.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the file without writing the buffered bytes
        drop(stale.into_parts());
        self.pending_len = 0;
        self.pending_appends = 0;
        let file = self.writer.get_ref();
        file.set_len(self.synced_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.compact")
    }

    /// Write the replacement log next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement over the live log and reopen it for append.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.pending_len = 0;
        self.pending_appends = 0;
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

    /// Every intact event in the log, in order. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::scan(path).map(|(events, _)| events)
    }

    /// Intact events plus the byte length they cover.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact_len = 0;
        loop {
            match read_frame(&mut reader)? {
                Frame::Event(event, len) => {
                    events.push(event);
                    intact_len += len;
                }
                Frame::End => break,
                Frame::Torn(why) => {
                    tracing::warn!(
                        path = %path.display(),
                        recovered = events.len(),
                        reason = why,
                        "discarding torn WAL tail"
                    );
                    break;
                }
            }
        }
        Ok((events, intact_len))
    }
}

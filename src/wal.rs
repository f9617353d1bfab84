use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{error, warn};

use crate::model::Event;

/// Upper bound on one encoded record; a larger length prefix means corruption.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Frame one event as `[u32 len][u32 crc32][bincode payload]`, little endian.
fn encode_record(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

enum ReadOutcome {
    Record(Vec<u8>),
    /// Clean end of file on a record boundary.
    End,
    /// Partial or corrupt record; everything from here on is dropped.
    Torn(&'static str),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_record(reader: &mut impl Read) -> io::Result<ReadOutcome> {
    let mut header = [0u8; 8];
    // A zero-byte read at a boundary is a clean end; anything shorter is torn.
    let mut first = [0u8; 1];
    if reader.read(&mut first)? == 0 {
        return Ok(ReadOutcome::End);
    }
    header[0] = first[0];
    if !read_exact_or_eof(reader, &mut header[1..])? {
        return Ok(ReadOutcome::Torn("truncated header"));
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_RECORD_LEN {
        return Ok(ReadOutcome::Torn("record length out of range"));
    }
    let mut payload = vec![0u8; len];
    if !read_exact_or_eof(reader, &mut payload)? {
        return Ok(ReadOutcome::Torn("truncated payload"));
    }
    if crc32fast::hash(&payload) != stored_crc {
        return Ok(ReadOutcome::Torn("checksum mismatch"));
    }
    Ok(ReadOutcome::Record(payload))
}

/// Append-only event log backing the engine.
///
/// A crash can leave a torn last record; replay stops at the first record
/// whose length, checksum or payload does not check out, and [`Wal::recover`]
/// cuts the file back to the last intact record before new appends land.
pub struct Wal {
    file: File,
    path: PathBuf,
    /// Bytes known to be durable on disk.
    len: u64,
    /// Encoded records waiting for the next `flush_sync`.
    pending: Vec<u8>,
    pending_records: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
            pending: Vec::new(),
            pending_records: 0,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event. The engine batches through
    /// `append_buffered` + `flush_sync` instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event; durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_record(&mut self.pending, event)?;
        self.pending_records += 1;
        Ok(())
    }

    /// Drop every buffered event without touching the file.
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_records = 0;
    }

    /// Write and fsync the buffered events as one unit. On failure the file
    /// is cut back to its last durable length, so none of them replay.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let written = self
            .file
            .write_all(&self.pending)
            .and_then(|()| self.file.sync_all());
        if let Err(e) = written {
            self.discard_pending();
            if let Err(cut) = self.file.set_len(self.len).and_then(|()| self.file.sync_all()) {
                error!(path = %self.path.display(), len = self.len, "WAL rollback failed: {cut}");
            }
            return Err(e);
        }
        self.len += self.pending.len() as u64;
        self.appends_since_compact += self.pending_records;
        self.discard_pending();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the snapshot events to a side file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_record(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = file.metadata()?.len();
        self.file = file;
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::read_intact(path)?.0)
    }

    /// Replay, then truncate anything past the last intact record so the
    /// next append follows it instead of a torn tail.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, intact) = Self::read_intact(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let len = file.metadata()?.len();
        if len > intact {
            file.set_len(intact)?;
            file.sync_all()?;
            warn!(path = %path.display(), from = len, to = intact, "WAL truncated to last intact record");
        }
        Ok(events)
    }

    /// Intact events and the byte length they span from the start of the file.
    fn read_intact(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact = 0u64;

        loop {
            match read_record(&mut reader)? {
                ReadOutcome::Record(payload) => match bincode::deserialize::<Event>(&payload) {
                    Ok(event) => {
                        intact += 8 + payload.len() as u64;
                        events.push(event);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), replayed = events.len(), "WAL tail dropped: undecodable payload: {e}");
                        break;
                    }
                },
                ReadOutcome::End => break,
                ReadOutcome::Torn(reason) => {
                    warn!(path = %path.display(), replayed = events.len(), "WAL tail dropped: {reason}");
                    break;
                }
            }
        }

        Ok((events, intact))
    }
}

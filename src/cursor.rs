use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Resume point into the decision log. The offset only means something
/// for the file identity (inode) it was captured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCursor {
    pub file_identity: Option<u64>,
    pub byte_offset: u64,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cannot open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot read identity of log file {path}: {source}")]
    Identity { path: PathBuf, source: io::Error },
    #[error("cannot seek log file {path} to offset {offset}: {source}")]
    Seek {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },
}

/// Batch reader over the currently available bytes of the log.
pub struct LogReader {
    reader: BufReader<File>,
    identity: u64,
    offset: u64,
    buf: Vec<u8>,
}

impl LogReader {
    /// Opens `path` positioned at the resume point recorded in `cursor`.
    /// Rotation (new inode) and truncation (same inode, shorter file)
    /// both restart from offset 0.
    pub fn open(path: &Path, cursor: &LogCursor) -> Result<Self, CursorError> {
        let file = File::open(path).map_err(|source| CursorError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let meta = file.metadata().map_err(|source| CursorError::Identity {
            path: path.to_path_buf(),
            source,
        })?;
        let identity = meta.ino();

        let offset = match cursor.file_identity {
            Some(known) if known == identity => {
                if cursor.byte_offset > meta.len() {
                    warn!(
                        "Log {} shrank below saved offset {} (len {}), reading from start",
                        path.display(),
                        cursor.byte_offset,
                        meta.len()
                    );
                    0
                } else {
                    cursor.byte_offset
                }
            }
            Some(known) => {
                info!(
                    "Log {} rotated (inode {} -> {}), reading from start",
                    path.display(),
                    known,
                    identity
                );
                0
            }
            None => 0,
        };

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|source| CursorError::Seek {
                path: path.to_path_buf(),
                offset,
                source,
            })?;
        debug!("Resuming {} at offset {}", path.display(), offset);

        Ok(Self {
            reader,
            identity,
            offset,
            buf: Vec::new(),
        })
    }

    /// Returns the next complete line, or `None` at the end of the
    /// available bytes. A trailing line without its newline is left
    /// unconsumed so the next run reads it whole.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let read = self.reader.read_until(b'\n', &mut self.buf)?;
        if read == 0 || self.buf.last() != Some(&b'\n') {
            return Ok(None);
        }
        self.offset += read as u64;
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }

    /// Cursor covering every line returned so far.
    pub fn cursor(&self) -> LogCursor {
        LogCursor {
            file_identity: Some(self.identity),
            byte_offset: self.offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn drain(reader: &mut LogReader) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().unwrap() {
            lines.push(line.trim_end().to_string());
        }
        lines
    }

    #[test]
    fn fresh_cursor_reads_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fw.log");
        fs::write(&path, "one\ntwo\n").unwrap();

        let mut reader = LogReader::open(&path, &LogCursor::default()).unwrap();
        assert_eq!(drain(&mut reader), vec!["one", "two"]);
        assert_eq!(reader.cursor().byte_offset, 8);
        assert!(reader.cursor().file_identity.is_some());
    }

    #[test]
    fn resumes_from_saved_offset_on_same_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fw.log");
        fs::write(&path, "one\ntwo\n").unwrap();

        let mut first = LogReader::open(&path, &LogCursor::default()).unwrap();
        drain(&mut first);
        let saved = first.cursor();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"three\n").unwrap();

        let mut second = LogReader::open(&path, &saved).unwrap();
        assert_eq!(drain(&mut second), vec!["three"]);
        assert_eq!(second.cursor().byte_offset, 14);
    }

    #[test]
    fn other_identity_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fw.log");
        fs::write(&path, "fresh\n").unwrap();

        let mut reader = LogReader::open(&path, &LogCursor::default()).unwrap();
        let identity = reader.cursor().file_identity.unwrap();
        drain(&mut reader);

        let stale = LogCursor {
            file_identity: Some(identity.wrapping_add(1)),
            byte_offset: 3,
        };
        let mut reader = LogReader::open(&path, &stale).unwrap();
        assert_eq!(drain(&mut reader), vec!["fresh"]);
    }

    #[test]
    fn truncated_file_restarts_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fw.log");
        fs::write(&path, "aaaa\nbbbb\ncccc\n").unwrap();

        let mut reader = LogReader::open(&path, &LogCursor::default()).unwrap();
        drain(&mut reader);
        let saved = reader.cursor();

        // copytruncate keeps the inode
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(0).unwrap();
        drop(file);
        fs::write(&path, "new\n").unwrap();

        let mut reader = LogReader::open(&path, &saved).unwrap();
        assert_eq!(drain(&mut reader), vec!["new"]);
    }

    #[test]
    fn unterminated_tail_is_left_for_next_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fw.log");
        fs::write(&path, "done\npart").unwrap();

        let mut reader = LogReader::open(&path, &LogCursor::default()).unwrap();
        assert_eq!(drain(&mut reader), vec!["done"]);
        let saved = reader.cursor();
        assert_eq!(saved.byte_offset, 5);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"ial\n").unwrap();

        let mut reader = LogReader::open(&path, &saved).unwrap();
        assert_eq!(drain(&mut reader), vec!["partial"]);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = TempDir::new().unwrap();
        let err = LogReader::open(&dir.path().join("absent.log"), &LogCursor::default())
            .err()
            .expect("open must fail");
        assert!(matches!(err, CursorError::Open { .. }));
    }
}

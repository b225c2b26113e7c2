// Destinations for an encoded graph.
//
// The layout pass streams bytes through a `Sink` and never seeks. A
// `FileSink` writes into a temporary file next to the destination and only
// renames it into place in `commit`, so the destination is either the old
// file or the complete new one. Dropping an uncommitted `FileSink` removes
// the temporary file.
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use tempfile::NamedTempFile;

pub trait Sink: std::fmt::Debug {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;

    /// Bytes written so far.
    fn position(&self) -> u64;

    /// Pads with zero bytes up to the next multiple of 4.
    fn align4(&mut self) -> anyhow::Result<()> {
        let pad = (4 - self.position() % 4) % 4;
        if pad > 0 {
            self.write(&[0; 3][..pad as usize])?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferSink {
    buf: Vec<u8>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Sink for BufferSink {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.buf
            .try_reserve(buf.len())
            .map_err(|_| anyhow!("out of memory"))?;
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }
}

#[derive(Debug)]
pub struct FileSink {
    file: BufWriter<NamedTempFile>,
    dest: PathBuf,
    pos: u64,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(dest: P) -> anyhow::Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let dir = match dest.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir)?;
        tracing::trace!(tmp = ?tmp.path(), ?dest, "opened temporary file");
        Ok(FileSink {
            file: BufWriter::new(tmp),
            dest,
            pos: 0,
        })
    }

    /// Flushes and syncs the temporary file, then renames it over the
    /// destination.
    pub fn commit(self) -> anyhow::Result<File> {
        let tmp = self.file.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        let file = tmp.persist(&self.dest)?;
        tracing::debug!(dest = ?self.dest, len = self.pos, "wrote file");
        Ok(file)
    }
}

impl Sink for FileSink {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.pos
    }
}

/// In-memory sink that can be told to start failing after a number of
/// writes.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MockSink {
    pub(crate) data: Vec<u8>,
    pub(crate) n_writes: usize,
    time_to_crash: Option<usize>,
}

#[cfg(test)]
impl MockSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn schedule_crash(&mut self, ops: usize) {
        self.time_to_crash = Some(ops);
    }
}

#[cfg(test)]
impl Sink for MockSink {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        match self.time_to_crash {
            Some(0) => anyhow::bail!("sink is down"),
            Some(x) => self.time_to_crash = Some(x - 1),
            None => {}
        }
        self.n_writes += 1;
        self.data.extend_from_slice(buf);
        Ok(())
    }

    fn position(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_align() -> anyhow::Result<()> {
        let mut s = BufferSink::new();
        s.align4()?;
        assert_eq!(0, s.position());
        s.write(&[1, 2, 3, 4, 5])?;
        s.align4()?;
        assert_eq!(vec![1, 2, 3, 4, 5, 0, 0, 0], s.into_inner());
        Ok(())
    }

    #[test]
    fn test_mock_crash() -> anyhow::Result<()> {
        let mut s = MockSink::new();
        s.schedule_crash(2);
        s.write(&[1])?;
        s.write(&[2])?;
        assert!(s.write(&[3]).is_err());
        assert_eq!(vec![1, 2], s.data);
        Ok(())
    }

    #[test]
    fn test_file_commit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"old")?;

        let mut s = FileSink::create(&dest)?;
        s.write(b"new contents")?;
        // not visible until committed
        assert_eq!(b"old".to_vec(), std::fs::read(&dest)?);
        s.commit()?;
        assert_eq!(b"new contents".to_vec(), std::fs::read(&dest)?);
        assert_eq!(1, std::fs::read_dir(dir.path())?.count());
        Ok(())
    }

    #[test]
    fn test_file_abandoned() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.bin");

        let mut s = FileSink::create(&dest)?;
        s.write(b"partial")?;
        drop(s);
        assert!(!dest.exists());
        assert_eq!(0, std::fs::read_dir(dir.path())?.count());
        Ok(())
    }
}

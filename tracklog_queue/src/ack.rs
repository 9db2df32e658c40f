use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use byteorder::{BigEndian, ByteOrder};

use crate::{Error, Result};

pub(crate) const ACK_FILE_NAME: &str = "last_ack_version";

const ACK_WIDTH: usize = std::mem::size_of::<u64>();

/// The persisted acknowledgment offset: one fixed-width big-endian `u64`, overwritten in place.
#[derive(Debug)]
pub(crate) struct AckFile {
    path: PathBuf,
    file: File,
}

impl AckFile {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(ACK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| Error::AckFile {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    /// The stored offset, 0 when nothing has been acknowledged yet.
    pub(crate) fn read(&mut self) -> Result<u64> {
        let mut buf = [0u8; ACK_WIDTH];
        let res = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_exact(&mut buf));
        match res {
            Ok(()) => Ok(BigEndian::read_u64(&buf)),
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Err(source) => Err(Error::AckFile {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub(crate) fn write(&mut self, version: u64) -> Result<()> {
        let mut buf = [0u8; ACK_WIDTH];
        BigEndian::write_u64(&mut buf, version);
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&buf))
            .and_then(|_| self.file.sync_data())
            .map_err(|source| Error::AckFile {
                path: self.path.clone(),
                source,
            })
    }
}

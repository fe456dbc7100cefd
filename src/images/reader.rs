// Connection-table image reader/writer
use prost::Message;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::checkpoint::{ConnTableImage, ImageEntry};
use crate::conn::Connection;
use crate::error::{ConnError, Result};
use crate::identity::ProcessIdentity;
use crate::proto::{ConnTableEntry, ConnTableHead};

pub const CONN_TABLE_IMG: &str = "conntable.img";
pub const CONN_TABLE_MAGIC: u32 = 0x4e4e_4f43;
pub const CONN_TABLE_TYPE: u32 = 0x0000_0001;

// Image format:
// - 4 bytes: magic number
// - 4 bytes: image type identifier
// - 4 bytes: head size (little-endian u32)
// - N bytes: ConnTableHead
// - then per entry: 4-byte size (little-endian u32) + ConnTableEntry
const HEADER_LEN: usize = 12;

pub struct ImageDir {
    path: PathBuf,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(ConnError::ImageNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(ImageDir { path })
    }

    /// Opens `path`, creating it first when missing.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(path.as_ref())?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file_buffer(&self, filename: &str) -> Result<Vec<u8>> {
        let img_path = self.path.join(filename);
        let mut file = File::open(&img_path).map_err(|_| ConnError::ImageNotFound {
            path: img_path.display().to_string(),
        })?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.len() < HEADER_LEN {
            return Err(ConnError::InvalidImage {
                reason: format!("{} is too small (< {} bytes)", filename, HEADER_LEN),
            });
        }

        let magic = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let kind = u32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]);
        if magic != CONN_TABLE_MAGIC || kind != CONN_TABLE_TYPE {
            return Err(ConnError::InvalidImage {
                reason: format!("{}: bad magic 0x{:08x}/0x{:08x}", filename, magic, kind),
            });
        }
        Ok(buffer)
    }

    /// Splits `[4 size][msg]...` records starting at `offset`.
    fn parse_entries<T>(buffer: &[u8], mut offset: usize, filename: &str) -> Result<Vec<T>>
    where
        T: Message + Default,
    {
        let mut entries = Vec::new();

        while offset < buffer.len() {
            if offset + 4 > buffer.len() {
                return Err(ConnError::InvalidImage {
                    reason: format!("{}: truncated size at offset {}", filename, offset),
                });
            }
            let msg_size = u32::from_le_bytes([
                buffer[offset],
                buffer[offset + 1],
                buffer[offset + 2],
                buffer[offset + 3],
            ]) as usize;
            offset += 4;

            if offset + msg_size > buffer.len() {
                return Err(ConnError::InvalidImage {
                    reason: format!(
                        "{}: expected {} bytes at offset {}, only {} available",
                        filename,
                        msg_size,
                        offset,
                        buffer.len() - offset
                    ),
                });
            }

            entries.push(T::decode(&buffer[offset..offset + msg_size])?);
            offset += msg_size;
        }

        log::debug!("Parsed {} messages from {}", entries.len(), filename);
        Ok(entries)
    }

    /// Read conntable.img
    pub fn read_conn_table(&self) -> Result<ConnTableImage> {
        let buffer = self.read_file_buffer(CONN_TABLE_IMG)?;

        let head_size = u32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]) as usize;
        if buffer.len() < HEADER_LEN + head_size {
            return Err(ConnError::InvalidImage {
                reason: format!("{} truncated (missing ConnTableHead)", CONN_TABLE_IMG),
            });
        }
        let head = ConnTableHead::decode(&buffer[HEADER_LEN..HEADER_LEN + head_size])?;

        let raw: Vec<ConnTableEntry> =
            Self::parse_entries(&buffer, HEADER_LEN + head_size, CONN_TABLE_IMG)?;
        if raw.len() != head.entries as usize {
            return Err(ConnError::InvalidImage {
                reason: format!(
                    "{}: head announces {} entries, found {}",
                    CONN_TABLE_IMG,
                    head.entries,
                    raw.len()
                ),
            });
        }

        let mut entries = Vec::with_capacity(raw.len());
        for entry in raw {
            let conn = entry.conn.as_ref().ok_or_else(|| ConnError::InvalidImage {
                reason: "entry without connection".into(),
            })?;
            entries.push(ImageEntry {
                conn: Connection::from_entry(conn)?,
                fds: entry.fds,
            });
        }

        Ok(ConnTableImage {
            run_id: head.run_id,
            this_process: head
                .this_process
                .as_ref()
                .map(ProcessIdentity::from_entry)
                .unwrap_or_default(),
            parent_process: head
                .parent_process
                .as_ref()
                .map(ProcessIdentity::from_entry)
                .unwrap_or_default(),
            entries,
        })
    }

    /// Write conntable.img, replacing any previous one.
    pub fn write_conn_table(&self, image: &ConnTableImage) -> Result<PathBuf> {
        let head = ConnTableHead {
            run_id: image.run_id.clone(),
            this_process: Some(image.this_process.to_entry()),
            parent_process: Some(image.parent_process.to_entry()),
            entries: image.entries.len() as u32,
        }
        .encode_to_vec();

        let mut buffer = Vec::new();
        buffer.extend_from_slice(&CONN_TABLE_MAGIC.to_le_bytes());
        buffer.extend_from_slice(&CONN_TABLE_TYPE.to_le_bytes());
        buffer.extend_from_slice(&(head.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&head);

        for entry in &image.entries {
            let msg = ConnTableEntry {
                conn: Some(entry.conn.to_entry()),
                fds: entry.fds.clone(),
            }
            .encode_to_vec();
            buffer.extend_from_slice(&(msg.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&msg);
        }

        let img_path = self.path.join(CONN_TABLE_IMG);
        let mut file = File::create(&img_path)?;
        file.write_all(&buffer)?;
        log::info!(
            "Wrote {} connections to {}",
            image.entries.len(),
            img_path.display()
        );
        Ok(img_path)
    }

    /// Load the connection-table checkpoint
    pub fn load_checkpoint(&self) -> Result<ConnTableImage> {
        self.read_conn_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDir::open(tmp.path().join("none")),
            Err(ConnError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_missing_image() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ImageDir::open(tmp.path()).unwrap();
        assert!(matches!(
            dir.read_conn_table(),
            Err(ConnError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_rejects_short_and_bad_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ImageDir::open(tmp.path()).unwrap();

        fs::write(tmp.path().join(CONN_TABLE_IMG), [1u8, 2, 3]).unwrap();
        assert!(matches!(
            dir.read_conn_table(),
            Err(ConnError::InvalidImage { .. })
        ));

        fs::write(tmp.path().join(CONN_TABLE_IMG), [0u8; 12]).unwrap();
        assert!(matches!(
            dir.read_conn_table(),
            Err(ConnError::InvalidImage { .. })
        ));
    }

    #[test]
    fn test_empty_table() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ImageDir::create(tmp.path().join("img")).unwrap();

        let image = ConnTableImage {
            run_id: "run-1".into(),
            this_process: ProcessIdentity::new(1, 2, 3),
            parent_process: ProcessIdentity::null(),
            entries: Vec::new(),
        };
        dir.write_conn_table(&image).unwrap();
        assert_eq!(dir.load_checkpoint().unwrap(), image);
    }

    #[test]
    fn test_truncated_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ImageDir::open(tmp.path()).unwrap();

        let image = ConnTableImage {
            run_id: "run-2".into(),
            this_process: ProcessIdentity::new(1, 2, 3),
            parent_process: ProcessIdentity::null(),
            entries: Vec::new(),
        };
        let path = dir.write_conn_table(&image).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            dir.read_conn_table(),
            Err(ConnError::InvalidImage { .. })
        ));
    }
}

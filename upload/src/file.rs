use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Identity of a logical file, used to reject a second upload of the same
/// file under a different job before any network traffic starts.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    /// File name without directories.
    pub name: String,

    /// Size in bytes.
    pub size: u64,

    /// Last-modified time, when the filesystem provides one.
    pub modified: Option<SystemTime>,
}

/// A local file being uploaded, read range-by-range.
///
/// Each range read opens its own handle so concurrently running part uploads
/// never contend on a shared seek position.
///
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,

    /// Size of the file in bytes, captured at open time.
    pub size: u64,

    /// Identity used for duplicate detection.
    pub identity: FileIdentity,
}

impl FileSource {
    /// Open `path` and capture its size and identity.
    ///
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Self {
            identity: FileIdentity {
                name,
                size: metadata.len(),
                modified: metadata.modified().ok(),
            },
            size: metadata.len(),
            path,
        })
    }

    /// Read the bytes in `[start, end)`.
    ///
    pub async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let len = (end - start) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn test_read_ranges() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"0123456789")?;
        file.flush()?;

        let source = FileSource::open(file.path()).await?;
        assert_eq!(source.size, 10);

        assert_eq!(source.read_range(0, 4).await?.as_ref(), b"0123");
        assert_eq!(source.read_range(4, 10).await?.as_ref(), b"456789");
        assert_eq!(source.read_range(9, 10).await?.as_ref(), b"9");
        Ok(())
    }

    #[tokio::test]
    async fn test_identity_captures_name_and_size() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(b"abc")?;
        file.flush()?;

        let source = FileSource::open(file.path()).await?;
        assert_eq!(source.identity.size, 3);
        assert!(!source.identity.name.is_empty());
        Ok(())
    }
}

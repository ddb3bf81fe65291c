//! Reads from POSIX paths and from the tape archive's online cache.

use crate::error::FetchError;

use bytes::Bytes;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// `EISDIR`: the location names a directory.
const EISDIR: i32 = 21;

/// Sorts a filesystem error into transient or permanent.
///
/// Missing files, permission problems and directories are permanent. Anything else, notably
/// stale NFS/SSHFS handles (`ESTALE`), interrupted reads and timeouts, is transient.
pub fn classify_io_error(location: &str, err: &std::io::Error) -> FetchError {
    let permanent = matches!(
        err.kind(),
        ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
    ) || err.raw_os_error() == Some(EISDIR);
    if permanent {
        FetchError::permanent(location, err)
    } else {
        FetchError::transient(location, err)
    }
}

/// Returns the size of a file.
pub async fn file_size(location: &str, path: &Path) -> Result<u64, FetchError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|err| classify_io_error(location, &err))?;
    if metadata.is_dir() {
        return Err(FetchError::permanent(location, "is a directory"));
    }
    Ok(metadata.len())
}

/// Reads `len` bytes of a file starting at `offset`.
pub async fn read_range(location: &str, path: &Path, offset: u64, len: u64) -> Result<Bytes, FetchError> {
    let classify = |err: std::io::Error| classify_io_error(location, &err);
    let mut file = tokio::fs::File::open(path).await.map_err(classify)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(classify)?;
    let len = usize::try_from(len).map_err(|err| FetchError::permanent(location, err))?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf).await.map_err(classify)?;
    Ok(buf.into())
}

/// Tape archive with an online disk cache.
///
/// Files become readable once the archive has copied them under `online_root`. Recalls are
/// requested by dropping a request file into `request_dir`.
#[derive(Clone, Debug)]
pub struct TapeArchive {
    pub online_root: PathBuf,
    pub request_dir: PathBuf,
}

impl TapeArchive {
    /// Path of the online copy of an archive path.
    pub fn online_path(&self, archive_path: &Path) -> PathBuf {
        self.online_root
            .join(archive_path.strip_prefix("/").unwrap_or(archive_path))
    }

    /// Path of the recall request file of an archive path.
    pub fn request_path(&self, archive_path: &Path) -> PathBuf {
        let digest = md5::compute(archive_path.as_os_str().as_encoded_bytes());
        self.request_dir.join(format!("{}.stage", hex::encode(digest.0)))
    }

    /// Resolves an archive path to its online copy, requesting a recall when there is none.
    ///
    /// Requesting is idempotent: an existing request file is left alone. A pending recall is a
    /// transient error so that the fetcher retries.
    pub async fn resolve(&self, location: &str, archive_path: &Path) -> Result<PathBuf, FetchError> {
        let online = self.online_path(archive_path);
        match tokio::fs::metadata(&online).await {
            Ok(_) => return Ok(online),
            Err(err) if err.kind() == ErrorKind::NotFound => (),
            Err(err) => return Err(classify_io_error(location, &err)),
        }
        let request = self.request_path(archive_path);
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&request)
            .await;
        match created {
            Ok(mut file) => {
                use tokio::io::AsyncWriteExt;
                file.write_all(archive_path.as_os_str().as_encoded_bytes())
                    .await
                    .map_err(|err| FetchError::transient(location, err))?;
                tracing::info!(location, request = %request.display(), "requested tape recall");
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => (),
            Err(err) => return Err(FetchError::transient(location, err)),
        }
        Err(FetchError::transient(location, "staging from tape"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        let permanent = [
            std::io::Error::from(ErrorKind::NotFound),
            std::io::Error::from(ErrorKind::PermissionDenied),
            std::io::Error::from_raw_os_error(EISDIR),
        ];
        for err in permanent {
            assert!(!classify_io_error("/a", &err).is_transient(), "{err}");
        }
        let transient = [
            // ESTALE
            std::io::Error::from_raw_os_error(116),
            std::io::Error::from(ErrorKind::TimedOut),
            std::io::Error::from(ErrorKind::Interrupted),
            std::io::Error::from(ErrorKind::UnexpectedEof),
        ];
        for err in transient {
            assert!(classify_io_error("/a", &err).is_transient(), "{err}");
        }
    }

    #[tokio::test]
    async fn read_file_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        assert_eq!(10, file_size("a", &path).await.unwrap());
        assert_eq!(&b"3456"[..], &read_range("a", &path, 3, 4).await.unwrap()[..]);
        assert!(read_range("a", &path, 8, 4).await.unwrap_err().is_transient());
        let missing = dir.path().join("missing.bin");
        assert!(!file_size("m", &missing).await.unwrap_err().is_transient());
        assert!(!file_size("d", dir.path()).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn tape_recall_is_requested_once() {
        let online = tempfile::tempdir().unwrap();
        let requests = tempfile::tempdir().unwrap();
        let tape = TapeArchive {
            online_root: online.path().to_path_buf(),
            request_dir: requests.path().to_path_buf(),
        };
        let archive_path = Path::new("/arch/exp/ta.nc");
        for _ in 0..2 {
            let err = tape.resolve("hsm:///arch/exp/ta.nc", archive_path).await.unwrap_err();
            assert!(err.is_transient());
        }
        let entries: Vec<_> = std::fs::read_dir(requests.path()).unwrap().collect();
        assert_eq!(1, entries.len());
        assert_eq!(
            b"/arch/exp/ta.nc".to_vec(),
            std::fs::read(tape.request_path(archive_path)).unwrap()
        );

        // Once the archive has staged the file it is read from the online root.
        let staged = online.path().join("arch/exp/ta.nc");
        std::fs::create_dir_all(staged.parent().unwrap()).unwrap();
        std::fs::write(&staged, b"data").unwrap();
        assert_eq!(staged, tape.resolve("hsm:///arch/exp/ta.nc", archive_path).await.unwrap());
    }
}

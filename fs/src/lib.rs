use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Cannot create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot walk directory '{path}': {source}")]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("Path '{path}' is not inside '{root}'")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Cannot copy file from '{from}' to '{to}': {source}")]
    CopyFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read directory '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot iterate directory '{path}': {source}")]
    ReadDirEntry {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read metadata '{path}': {source}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot create file '{path}': {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot open file '{path}': {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot determine if path exists '{path}': {source}")]
    PathExists {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot rename file from '{from}' to '{to}': {source}")]
    RenameFile {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot remove directory '{path}': {source}")]
    RemoveDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub async fn create_dir<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::create_dir_all(p)
        .await
        .map_err(|source| FsError::CreateDir {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn remove_dir<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::remove_dir(p).await.map_err(|source| FsError::RemoveDir {
        path: p.to_path_buf(),
        source,
    })
}

/// Recursively copy the contents of `from` into `to`, returning the number of
/// files copied.
///
/// Only directories and regular files are copied. Symlinks are skipped since
/// FAT volumes cannot hold them.
pub async fn copy_dir<F: AsRef<Path>, T: AsRef<Path>>(from: F, to: T) -> Result<u64, FsError> {
    let from_path = from.as_ref();
    let to_path = to.as_ref();

    create_dir(to_path).await?;

    let mut count = 0;
    for entry in WalkDir::new(from_path).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|source| FsError::Walk {
            path: from_path.to_path_buf(),
            source,
        })?;
        let relative =
            entry
                .path()
                .strip_prefix(from_path)
                .map_err(|_| FsError::OutsideRoot {
                    path: entry.path().to_path_buf(),
                    root: from_path.to_path_buf(),
                })?;
        let target = to_path.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            create_dir(&target).await?;
        } else if file_type.is_file() {
            trace!(from = %entry.path().display(), to = %target.display(), "copy");
            copy_file(entry.path(), &target).await?;
            count += 1;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(count)
}

/// Copy the regular files directly inside `from` into `to`, without recursing.
pub async fn copy_dir_files<F: AsRef<Path>, T: AsRef<Path>>(
    from: F,
    to: T,
) -> Result<u64, FsError> {
    let from_path = from.as_ref();
    let to_path = to.as_ref();

    create_dir(to_path).await?;

    let mut count = 0;
    for path in read_dir(from_path).await? {
        if is_file(&path).await? {
            if let Some(name) = path.file_name() {
                copy_file(&path, to_path.join(name)).await?;
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Copy file contents only. Permissions and timestamps are not carried over,
/// which FAT volumes would reject anyway.
pub async fn copy_file<F: AsRef<Path>, T: AsRef<Path>>(from: F, to: T) -> Result<(), FsError> {
    let from_path = from.as_ref();
    let to_path = to.as_ref();
    let copy_error = |source| FsError::CopyFile {
        from: from_path.to_path_buf(),
        to: to_path.to_path_buf(),
        source,
    };

    let mut source = open_file(from_path).await?;
    let mut destination = create_file(to_path).await?;
    tokio::io::copy(&mut source, &mut destination)
        .await
        .map_err(copy_error)?;
    destination.flush().await.map_err(copy_error)?;
    Ok(())
}

pub async fn read_dir<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>, FsError> {
    let p = path.as_ref();
    let mut dir = fs::read_dir(p).await.map_err(|source| FsError::ReadDir {
        path: p.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|source| FsError::ReadDirEntry {
            path: p.to_path_buf(),
            source,
        })?
    {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

pub async fn is_file<P: AsRef<Path>>(path: P) -> Result<bool, FsError> {
    let p = path.as_ref();
    let metadata = fs::metadata(p).await.map_err(|source| FsError::Metadata {
        path: p.to_path_buf(),
        source,
    })?;
    Ok(metadata.is_file())
}

pub async fn is_dir<P: AsRef<Path>>(path: P) -> Result<bool, FsError> {
    let p = path.as_ref();
    let metadata = fs::metadata(p).await.map_err(|source| FsError::Metadata {
        path: p.to_path_buf(),
        source,
    })?;
    Ok(metadata.is_dir())
}

pub async fn create_file<P: AsRef<Path>>(path: P) -> Result<tokio::fs::File, FsError> {
    let p = path.as_ref();
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn open_file<P: AsRef<Path>>(path: P) -> Result<tokio::fs::File, FsError> {
    let p = path.as_ref();
    fs::File::open(p).await.map_err(|source| FsError::OpenFile {
        path: p.to_path_buf(),
        source,
    })
}

pub async fn path_exists<P: AsRef<Path>>(path: P) -> Result<bool, FsError> {
    let p = path.as_ref();
    fs::try_exists(p)
        .await
        .map_err(|source| FsError::PathExists {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn write_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), FsError> {
    let p = path.as_ref();
    let mut file = create_file(p).await?;
    file.write_all(data)
        .await
        .map_err(|source| FsError::WriteFile {
            path: p.to_path_buf(),
            source,
        })?;
    file.flush().await.map_err(|source| FsError::WriteFile {
        path: p.to_path_buf(),
        source,
    })
}

/// Write `data` to a temporary sibling of `path` and rename it into place, so
/// readers observe either the old file or the complete new one.
///
/// The temporary file is removed if anything fails before the rename.
pub async fn write_file_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), FsError> {
    let p = path.as_ref();
    let dir = match p.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = match p.file_name() {
        Some(name) => format!(".{}.", name.to_string_lossy()),
        None => ".vcfkit.".to_owned(),
    };

    let temp_path = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|source| FsError::CreateFile {
            path: dir.to_path_buf(),
            source,
        })?
        .into_temp_path();

    write_file(&temp_path, data).await?;

    temp_path.persist(p).map_err(|err| FsError::RenameFile {
        from: err.path.to_path_buf(),
        to: p.to_path_buf(),
        source: err.error,
    })
}

pub async fn read_file_to_string<P: AsRef<Path>>(path: P) -> Result<String, FsError> {
    let p = path.as_ref();
    fs::read_to_string(p)
        .await
        .map_err(|source| FsError::ReadFile {
            path: p.to_path_buf(),
            source,
        })
}

/// Read exactly `len` bytes starting at `offset`. Returns `None` when the file
/// is too short.
pub async fn read_at<P: AsRef<Path>>(
    path: P,
    offset: u64,
    len: usize,
) -> Result<Option<Vec<u8>>, FsError> {
    let p = path.as_ref();
    let read_error = |source| FsError::ReadFile {
        path: p.to_path_buf(),
        source,
    };

    let mut file = open_file(p).await?;
    let size = file.metadata().await.map_err(read_error)?.len();
    if size < offset + len as u64 {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(offset)).await.map_err(read_error)?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf).await.map_err(read_error)?;
    Ok(Some(buf))
}

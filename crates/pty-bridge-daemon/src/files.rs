//! Whole-file reads and writes for the extension's settings editor.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::FileError;

const FILE_MODE: u32 = 0o644;

/// Reads `path` as text. A missing file reads as empty.
pub async fn read_file(path: &Path) -> Result<String, FileError> {
    require_absolute(path)?;
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(FileError::Io {
            operation: "read",
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Creates or truncates `path` and writes `content` to it.
pub async fn write_file(path: &Path, content: &str) -> Result<(), FileError> {
    require_absolute(path)?;
    let io_err = |source| FileError::Io {
        operation: "write",
        path: path.display().to_string(),
        source,
    };
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .await
        .map_err(io_err)?;
    file.write_all(content.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)
}

fn require_absolute(path: &Path) -> Result<(), FileError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(FileError::RelativePath(path.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        write_file(&path, "{\"theme\":\"dark\"}").await.unwrap();
        assert_eq!(read_file(&path).await.unwrap(), "{\"theme\":\"dark\"}");

        write_file(&path, "{}").await.unwrap();
        assert_eq!(read_file(&path).await.unwrap(), "{}");

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_file(&dir.path().join("nope")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_relative_paths_rejected() {
        assert!(matches!(
            read_file(Path::new("relative.txt")).await,
            Err(FileError::RelativePath(_))
        ));
        assert!(matches!(
            write_file(Path::new("relative.txt"), "x").await,
            Err(FileError::RelativePath(_))
        ));
    }

    #[tokio::test]
    async fn test_write_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_file(&dir.path().join("missing/file.txt"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::Io { operation: "write", .. }));
    }
}

//! Writing response streams to disk.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::error::{HttpError, Result};

/// Copy every chunk of `stream` into `path`, truncating any existing file.
///
/// Parent directories are created first when `create_parent_dirs` is set.
/// Returns the path that was written.
pub async fn write_stream_to_file<S>(
    stream: S,
    path: impl AsRef<Path>,
    create_parent_dirs: bool,
) -> Result<PathBuf>
where
    S: Stream<Item = Result<Bytes>>,
{
    let path = path.as_ref();

    if create_parent_dirs {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = tokio::fs::File::create(path).await?;
    let written = copy_stream(stream, &mut file).await?;
    file.flush().await?;

    tracing::debug!(path = %path.display(), bytes = written, "wrote response body to file");
    Ok(path.to_path_buf())
}

/// Copy every chunk of `stream` into `sink`, returning the number of bytes copied.
pub async fn copy_stream<S, W>(stream: S, sink: &mut W) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>>,
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    futures_util::pin_mut!(stream);
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk).await.map_err(HttpError::Io)?;
        written += chunk.len() as u64;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/out.txt");

        let written = write_stream_to_file(chunks(&["hello ", "world"]), &target, true)
            .await
            .unwrap();

        assert_eq!(written, target);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_write_without_parent_dirs_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing/out.txt");

        let err = write_stream_to_file(chunks(&["x"]), &target, false)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Io(_)));
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(HttpError::Timeout),
        ]);

        let err = write_stream_to_file(failing, dir.path().join("f"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Timeout));
    }

    #[tokio::test]
    async fn test_copy_stream_counts_bytes() {
        let mut sink = Vec::new();
        let n = copy_stream(chunks(&["ab", "cde"]), &mut sink).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"abcde");
    }
}

//! Log tailing for failure diagnostics.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Never read more than this many trailing bytes of a log.
pub const MAX_TAIL_BYTES: u64 = 64 * 1024;

/// Last `max_lines` lines of the file at `path`, each terminated by `\n`.
///
/// Reads at most [`MAX_TAIL_BYTES`] from the end of the file. Invalid UTF-8
/// is replaced rather than rejected.
pub async fn tail_log(path: &Path, max_lines: usize) -> std::io::Result<String> {
    if max_lines == 0 {
        return Ok(String::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = len.saturating_sub(MAX_TAIL_BYTES);
    file.seek(SeekFrom::Start(offset)).await?;

    let mut bytes = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut bytes).await?;
    let text = String::from_utf8_lossy(&bytes);

    let mut lines: Vec<&str> = text.lines().collect();
    if offset > 0 && !lines.is_empty() {
        // First line was cut by the byte window.
        lines.remove(0);
    }
    let start = lines.len().saturating_sub(max_lines);

    let mut tail = String::new();
    for line in &lines[start..] {
        tail.push_str(line);
        tail.push('\n');
    }
    Ok(tail)
}

/// Like [`tail_log`] but any failure, including a missing path, yields an
/// empty string.
pub async fn tail_or_empty(path: Option<&Path>, max_lines: usize) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match tail_log(path, max_lines).await {
        Ok(tail) => tail,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read log for diagnostics");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tail_keeps_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log");
        std::fs::write(&path, "one\ntwo\nthree\nfour\n").unwrap();

        assert_eq!(tail_log(&path, 2).await.unwrap(), "three\nfour\n");
        assert_eq!(tail_log(&path, 10).await.unwrap(), "one\ntwo\nthree\nfour\n");
        assert_eq!(tail_log(&path, 0).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_tail_of_large_file_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut content = String::new();
        for i in 0..20_000 {
            content.push_str(&format!("line {}\n", i));
        }
        std::fs::write(&path, &content).unwrap();

        let tail = tail_log(&path, 3).await.unwrap();
        assert_eq!(tail, "line 19997\nline 19998\nline 19999\n");
    }

    #[tokio::test]
    async fn test_unreadable_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.log");
        assert_eq!(tail_or_empty(Some(&missing), 5).await, "");
        assert_eq!(tail_or_empty(None, 5).await, "");
    }
}

//! Worker log streaming
//!
//! Tails a worker's log file to the operator while the worker runs. Purely
//! observational: it stops when the worker's completion is signalled, not
//! when it reaches end-of-file, and never holds up the wait on the worker.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Follows growing log files
#[derive(Debug, Clone, Copy)]
pub struct LogStreamer {
    poll_interval: Duration,
}

impl LogStreamer {
    /// Creates a streamer polling for new output every `poll_interval`
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Emits each complete line of `path` until `done` is cancelled
    ///
    /// Whatever was written before cancellation is drained, including a final
    /// unterminated line. The file may not exist yet when following starts.
    ///
    /// # Returns
    /// Number of lines emitted
    pub async fn follow<F>(
        &self,
        path: &Path,
        done: CancellationToken,
        mut emit: F,
    ) -> std::io::Result<usize>
    where
        F: FnMut(&str) + Send,
    {
        let mut file: Option<File> = None;
        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; 8192];
        let mut emitted = 0;

        loop {
            // Sample before reading so the last read happens after completion
            let finished = done.is_cancelled();

            if file.is_none() {
                match File::open(path).await {
                    Ok(opened) => file = Some(opened),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }

            if let Some(file) = file.as_mut() {
                loop {
                    let read = file.read(&mut chunk).await?;
                    if read == 0 {
                        break;
                    }
                    pending.extend_from_slice(&chunk[..read]);
                    emitted += drain_lines(&mut pending, &mut emit);
                }
            }

            if finished {
                if !pending.is_empty() {
                    emit(String::from_utf8_lossy(&pending).trim_end_matches('\r'));
                    emitted += 1;
                }
                return Ok(emitted);
            }

            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

fn drain_lines<F: FnMut(&str)>(pending: &mut Vec<u8>, emit: &mut F) -> usize {
    let mut count = 0;
    while let Some(newline) = pending.iter().position(|byte| *byte == b'\n') {
        let line: Vec<u8> = pending.drain(..=newline).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        emit(text.trim_end_matches('\r'));
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn collector() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        (lines, move |line: &str| sink.lock().unwrap().push(line.to_string()))
    }

    #[tokio::test]
    async fn test_follows_growing_file_until_done() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.log");
        let done = CancellationToken::new();
        let (lines, emit) = collector();

        let streamer = LogStreamer::new(Duration::from_millis(5));
        let follow_path = path.clone();
        let follow_done = done.clone();
        let follower =
            tokio::spawn(async move { streamer.follow(&follow_path, follow_done, emit).await });

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "first").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        write!(file, "second\r\nthird").unwrap();
        file.flush().unwrap();

        done.cancel();
        let emitted = follower.await.unwrap().unwrap();

        assert_eq!(emitted, 3);
        assert_eq!(*lines.lock().unwrap(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_missing_file_ends_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let done = CancellationToken::new();
        done.cancel();
        let (lines, emit) = collector();

        let emitted = LogStreamer::new(Duration::from_millis(5))
            .follow(&dir.path().join("never.log"), done, emit)
            .await
            .unwrap();

        assert_eq!(emitted, 0);
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_drain_lines_keeps_partial_tail() {
        let mut pending = b"a\nb\npartial".to_vec();
        let mut seen = Vec::new();
        let count = drain_lines(&mut pending, &mut |line: &str| seen.push(line.to_string()));
        assert_eq!(count, 2);
        assert_eq!(seen, ["a", "b"]);
        assert_eq!(pending, b"partial");
    }
}

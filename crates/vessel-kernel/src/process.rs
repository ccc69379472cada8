//! Line-by-line relay of a child process's output.
//!
//! Each pipe gets its own drain task; both feed one channel so the reader
//! sees lines in the order they were read. Lines are decoded lossily and
//! a final line without a newline is still delivered.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use vessel_types::LogLevel;

/// Interleaved stdout/stderr lines of one process.
pub struct OutputLines {
    receiver: mpsc::Receiver<(LogLevel, String)>,
    tasks: Vec<JoinHandle<()>>,
}

impl OutputLines {
    /// Start draining whichever pipes are present.
    pub fn new<O, E>(stdout: Option<O>, stderr: Option<E>) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(256);
        let mut tasks = Vec::with_capacity(2);
        if let Some(pipe) = stdout {
            tasks.push(tokio::spawn(drain_lines(pipe, LogLevel::Stdout, sender.clone())));
        }
        if let Some(pipe) = stderr {
            tasks.push(tokio::spawn(drain_lines(pipe, LogLevel::Stderr, sender)));
        }
        Self { receiver, tasks }
    }

    /// Next line, or `None` once both pipes hit EOF.
    pub async fn next(&mut self) -> Option<(LogLevel, String)> {
        self.receiver.recv().await
    }
}

impl Drop for OutputLines {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn drain_lines<R>(pipe: R, level: LogLevel, sender: mpsc::Sender<(LogLevel, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if sender.send((level, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("pipe read failed: {}", e);
                break;
            }
        }
    }
}

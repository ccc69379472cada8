//! The worker agent: the process a bridge launches inside an environment.
//!
//! It reads [`AgentRequest`] lines on stdin and answers with
//! [`AgentEvent`] lines on stdout. Stdout belongs to the control channel,
//! so diagnostics go to stderr (relayed by the bridge as BRIDGE logs).
//!
//! Payloads are decoded by the codec named in their method tag:
//!
//! | Method | Payload | Result |
//! |--------|---------|--------|
//! | `shell` | a `sh` script | last non-empty stdout line, as `json` |
//! | `echo` | anything | the payload unchanged |

use std::collections::VecDeque;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use vessel_kernel::process::OutputLines;
use vessel_types::{
    AgentEvent, AgentRequest, JSON_METHOD, LogEntry, LogLevel, SerializedObject,
};

/// Stderr lines kept for the traceback of a failed script.
const TRACEBACK_LINES: usize = 20;

/// Payload codecs understood by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Shell,
    Echo,
}

impl Codec {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "shell" => Some(Codec::Shell),
            "echo" => Some(Codec::Echo),
            _ => None,
        }
    }
}

/// Serve requests until stdin closes or a shutdown request arrives.
pub async fn serve<R, W>(input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(input, LinesCodec::new());
    let mut writer = FramedWrite::new(output, LinesCodec::new());
    let mut agent = Agent::default();

    while let Some(line) = reader.next().await {
        let line = line.context("failed to read request")?;
        let request: AgentRequest =
            serde_json::from_str(&line).context("malformed request from bridge")?;
        match request {
            AgentRequest::Shutdown => {
                tracing::debug!("shutdown requested");
                break;
            }
            AgentRequest::Run { function, setup } => {
                let result = agent.run(function, setup, &mut writer).await?;
                send(&mut writer, AgentEvent::Result { object: result }).await?;
                send(&mut writer, AgentEvent::Finished).await?;
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct Agent {
    /// Result of the setup function, passed to every call.
    setup_value: Option<String>,
    setup_done: bool,
}

impl Agent {
    async fn run<S>(
        &mut self,
        function: SerializedObject,
        setup: Option<SerializedObject>,
        writer: &mut S,
    ) -> Result<SerializedObject>
    where
        S: Sink<String, Error = LinesCodecError> + Unpin,
    {
        if let Some(setup) = setup.filter(|_| !self.setup_done) {
            send(
                writer,
                AgentEvent::Log {
                    entry: LogEntry::bridge(LogLevel::Trace, "Running setup function"),
                },
            )
            .await?;
            let value = execute(&setup, None, writer).await?;
            if value.raised {
                return Ok(value);
            }
            self.setup_value = argument_text(&value);
            self.setup_done = true;
        }
        execute(&function, self.setup_value.as_deref(), writer).await
    }
}

/// Text handed to a shell script as `$1`.
fn argument_text(object: &SerializedObject) -> Option<String> {
    match object.as_json() {
        Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
        None => object.payload_str().map(String::from),
    }
}

async fn execute<S>(
    object: &SerializedObject,
    argument: Option<&str>,
    writer: &mut S,
) -> Result<SerializedObject>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    match Codec::from_method(&object.method) {
        Some(Codec::Echo) => Ok(object.clone()),
        Some(Codec::Shell) => {
            let Some(script) = object.payload_str() else {
                return Ok(raised(json!({"error": "shell payload is not valid UTF-8"}), None));
            };
            run_shell(script, argument, writer).await
        }
        None => Ok(raised(
            json!({"error": format!("unsupported serialization method '{}'", object.method)}),
            None,
        )),
    }
}

fn raised(value: serde_json::Value, traceback: Option<String>) -> SerializedObject {
    SerializedObject::raised(JSON_METHOD, value.to_string().into_bytes(), traceback)
}

async fn run_shell<S>(script: &str, argument: Option<&str>, writer: &mut S) -> Result<SerializedObject>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).arg("vessel-agent");
    if let Some(argument) = argument {
        cmd.arg(argument);
    }
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return Ok(raised(json!({"error": format!("failed to start sh: {e}")}), None)),
    };

    let mut lines = OutputLines::new(child.stdout.take(), child.stderr.take());
    let mut last_stdout: Option<String> = None;
    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(TRACEBACK_LINES);
    while let Some((level, line)) = lines.next().await {
        match level {
            LogLevel::Stdout if !line.trim().is_empty() => last_stdout = Some(line.clone()),
            LogLevel::Stderr => {
                if stderr_tail.len() == TRACEBACK_LINES {
                    stderr_tail.pop_front();
                }
                stderr_tail.push_back(line.clone());
            }
            _ => {}
        }
        send(
            writer,
            AgentEvent::Log {
                entry: LogEntry::user(level, line),
            },
        )
        .await?;
    }

    let status = child.wait().await.context("failed to wait for script")?;
    let value = last_stdout
        .map(serde_json::Value::String)
        .unwrap_or(serde_json::Value::Null);
    if status.success() {
        Ok(SerializedObject::json(&value))
    } else {
        let traceback = Vec::from(stderr_tail).join("\n");
        Ok(raised(
            json!({"exit_code": status.code(), "output": value}),
            Some(traceback),
        ))
    }
}

async fn send<S>(writer: &mut S, event: AgentEvent) -> Result<()>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    let line = serde_json::to_string(&event).context("failed to encode event")?;
    writer.send(line).await.context("failed to write to bridge")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn run_line(function: SerializedObject, setup: Option<SerializedObject>) -> String {
        serde_json::to_string(&AgentRequest::Run { function, setup }).unwrap()
    }

    /// Feed `requests` to the agent and collect every event it writes.
    async fn converse(requests: Vec<String>) -> Vec<AgentEvent> {
        let (mut client, agent_in) = tokio::io::duplex(64 * 1024);
        let (agent_out, client_out) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(agent_in, agent_out));
        for request in requests {
            client.write_all(request.as_bytes()).await.unwrap();
            client.write_all(b"\n").await.unwrap();
        }
        drop(client);
        server.await.unwrap().unwrap();
        let mut events = Vec::new();
        let mut lines = BufReader::new(client_out).lines();
        while let Some(line) = lines.next_line().await.unwrap() {
            events.push(serde_json::from_str(&line).unwrap());
        }
        events
    }

    fn results(events: &[AgentEvent]) -> Vec<SerializedObject> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Result { object } => Some(object.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let function = SerializedObject::new("echo", b"payload".to_vec());
        let events = converse(vec![run_line(function.clone(), None)]).await;
        assert_eq!(results(&events), vec![function]);
        assert_eq!(events.last(), Some(&AgentEvent::Finished));
    }

    #[tokio::test]
    async fn test_shell_logs_and_result() {
        let script = SerializedObject::new("shell", b"echo out; echo err >&2; echo 42".to_vec());
        let events = converse(vec![run_line(script, None)]).await;
        let logs: Vec<LogEntry> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Log { entry } => Some(entry.clone()),
                _ => None,
            })
            .collect();
        assert!(logs.contains(&LogEntry::user(LogLevel::Stdout, "out")));
        assert!(logs.contains(&LogEntry::user(LogLevel::Stderr, "err")));
        let result = &results(&events)[0];
        assert!(!result.raised);
        assert_eq!(result.as_json(), Some(json!("42")));
    }

    #[tokio::test]
    async fn test_failing_script_is_raised() {
        let script = SerializedObject::new("shell", b"echo boom >&2; exit 2".to_vec());
        let events = converse(vec![run_line(script, None)]).await;
        let result = &results(&events)[0];
        assert!(result.raised);
        assert_eq!(result.traceback.as_deref(), Some("boom"));
        assert_eq!(result.as_json().unwrap()["exit_code"], json!(2));
    }

    #[tokio::test]
    async fn test_setup_runs_once_and_feeds_argument() {
        let setup = SerializedObject::new("shell", b"echo setup >&2; echo ready".to_vec());
        let function = SerializedObject::new("shell", b"echo \"$1\"".to_vec());
        let events = converse(vec![
            run_line(function.clone(), Some(setup.clone())),
            run_line(function.clone(), Some(setup)),
            run_line(function, None),
        ])
        .await;
        let values: Vec<_> = results(&events).iter().map(|r| r.as_json()).collect();
        assert_eq!(values, vec![Some(json!("ready")); 3]);
        let setup_logs = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Log { entry } if entry.message == "setup"))
            .count();
        assert_eq!(setup_logs, 1);
    }

    #[tokio::test]
    async fn test_unknown_method_is_raised() {
        let events = converse(vec![run_line(
            SerializedObject::new("pickle", b"x".to_vec()),
            None,
        )])
        .await;
        let result = &results(&events)[0];
        assert!(result.raised);
        assert!(result.payload_str().unwrap().contains("pickle"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let events = converse(vec![
            serde_json::to_string(&AgentRequest::Shutdown).unwrap(),
            run_line(SerializedObject::new("echo", Vec::new()), None),
        ])
        .await;
        assert!(events.is_empty());
    }
}

//! A live connection to one worker agent process.
//!
//! The agent speaks newline-delimited JSON on stdin/stdout (see
//! [`vessel_types::AgentRequest`]). Its stderr is relayed as BRIDGE logs to
//! whichever session currently holds the bridge.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::instrument;

use vessel_types::{
    AgentEvent, AgentRequest, EnvironmentKey, LogEntry, LogLevel, SerializedObject, VesselError,
};

use crate::config::Settings;
use crate::handle::LaunchSpec;
use crate::multiplex::LogSink;
use crate::pool::PooledBridge;
use crate::process::OutputLines;

type SinkSlot = Arc<Mutex<Option<LogSink>>>;

/// One worker process bound to one composed environment.
pub struct Bridge {
    key: EnvironmentKey,
    pid: u32,
    program: PathBuf,
    child: Child,
    writer: FramedWrite<ChildStdin, LinesCodec>,
    reader: FramedRead<ChildStdout, LinesCodec>,
    diagnostics: SinkSlot,
    relay: JoinHandle<()>,
    max_send_message_length: usize,
    max_receive_message_length: usize,
    setup_sent: bool,
    in_flight: bool,
    broken: bool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("key", &self.key.short())
            .field("pid", &self.pid)
            .field("setup_sent", &self.setup_sent)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Bridge {
    /// Launch the agent inside the composed environment.
    #[instrument(level = "debug", skip(launch, settings), fields(key = %key.short()))]
    pub async fn spawn(
        key: EnvironmentKey,
        launch: &LaunchSpec,
        settings: &Settings,
    ) -> Result<Self, VesselError> {
        let program = settings.agent_program.clone();
        let mut cmd = Command::new(&program);
        if let Some(path) = launch.search_path(std::env::var_os("PATH").as_deref()) {
            cmd.env("PATH", path);
        }
        cmd.envs(&launch.env);
        if let Some(dir) = &launch.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            VesselError::BridgeFailure(format!(
                "failed to start agent {}: {}",
                program.display(),
                e
            ))
        })?;
        let pid = child.id().unwrap_or_default();

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(VesselError::BridgeFailure(
                "agent started without control pipes".to_string(),
            ));
        };

        let diagnostics: SinkSlot = Arc::new(Mutex::new(None));
        let relay = tokio::spawn(relay_stderr(
            OutputLines::new(None::<ChildStdout>, child.stderr.take()),
            diagnostics.clone(),
            pid,
        ));

        tracing::debug!(pid, program = %program.display(), "agent started");
        Ok(Self {
            key,
            pid,
            program,
            child,
            writer: FramedWrite::new(stdin, LinesCodec::new()),
            reader: FramedRead::new(
                stdout,
                LinesCodec::new_with_max_length(settings.max_receive_message_length),
            ),
            diagnostics,
            relay,
            max_send_message_length: settings.max_send_message_length,
            max_receive_message_length: settings.max_receive_message_length,
            setup_sent: false,
            in_flight: false,
            broken: false,
        })
    }

    pub fn key(&self) -> EnvironmentKey {
        self.key
    }

    /// OS process id of the agent.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True after a failed exchange left the control channel unusable.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// True once setup has been delivered to this agent.
    pub fn setup_sent(&self) -> bool {
        self.setup_sent
    }

    /// Execute `function` and return its single result.
    ///
    /// `setup` is forwarded only on the first run of this bridge. Logs from
    /// the agent go to `sink` in the order they arrive.
    #[instrument(level = "debug", skip_all, fields(pid = self.pid, method = %function.method))]
    pub async fn run(
        &mut self,
        function: &SerializedObject,
        setup: Option<&SerializedObject>,
        sink: &LogSink,
    ) -> Result<SerializedObject, VesselError> {
        if self.broken {
            return Err(VesselError::BridgeFailure(
                "bridge is no longer usable".to_string(),
            ));
        }
        let request = AgentRequest::Run {
            function: function.clone(),
            setup: if self.setup_sent { None } else { setup.cloned() },
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| VesselError::InvariantViolation(format!("encode request: {e}")))?;
        if line.len() > self.max_send_message_length {
            return Err(VesselError::TransportLimitExceeded(format!(
                "Sent message larger than max ({} vs. {})",
                line.len(),
                self.max_send_message_length
            )));
        }

        self.set_diagnostics(Some(sink.clone()));
        self.in_flight = true;
        let outcome = self.exchange(line).await;
        self.set_diagnostics(None);

        match &outcome {
            Ok(_) => {
                self.in_flight = false;
                if setup.is_some() {
                    self.setup_sent = true;
                }
            }
            Err(err) => {
                tracing::warn!(pid = self.pid, "bridge run failed: {}", err);
                self.broken = true;
            }
        }
        outcome
    }

    async fn exchange(&mut self, line: String) -> Result<SerializedObject, VesselError> {
        self.writer.send(line).await.map_err(|e| {
            VesselError::BridgeFailure(format!("failed to write to agent {}: {}", self.pid, e))
        })?;

        let mut result: Option<SerializedObject> = None;
        loop {
            match self.reader.next().await {
                Some(Ok(frame)) => {
                    let event: AgentEvent = serde_json::from_str(&frame).map_err(|e| {
                        VesselError::BridgeFailure(format!("malformed frame from agent: {e}"))
                    })?;
                    match event {
                        AgentEvent::Log { entry } => self.forward(entry).await,
                        AgentEvent::Result { object } => {
                            if result.is_some() {
                                return Err(VesselError::InvariantViolation(
                                    "agent sent more than one result for a single call"
                                        .to_string(),
                                ));
                            }
                            result = Some(object);
                        }
                        AgentEvent::Finished => break,
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(VesselError::TransportLimitExceeded(format!(
                        "Received message larger than max (limit {})",
                        self.max_receive_message_length
                    )));
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(VesselError::BridgeFailure(format!(
                        "failed to read from agent {}: {}",
                        self.pid, e
                    )));
                }
                None => {
                    let status = match self.child.try_wait() {
                        Ok(Some(status)) => status.to_string(),
                        _ => "connection closed".to_string(),
                    };
                    return Err(VesselError::BridgeFailure(format!(
                        "never received a result (agent {}: {})",
                        self.pid, status
                    )));
                }
            }
        }
        result.ok_or_else(|| VesselError::BridgeFailure("never received a result".to_string()))
    }

    async fn forward(&self, entry: LogEntry) {
        if let Some(sink) = self.current_sink() {
            sink.emit(entry).await;
        }
    }

    fn current_sink(&self) -> Option<LogSink> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_diagnostics(&self, sink: Option<LogSink>) {
        *self.diagnostics.lock().unwrap_or_else(|e| e.into_inner()) = sink;
    }

    /// Ask the agent to exit, then make sure it is gone.
    pub async fn shutdown(mut self) {
        if !self.broken && !self.in_flight {
            if let Ok(line) = serde_json::to_string(&AgentRequest::Shutdown) {
                let _ = self.writer.send(line).await;
            }
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), self.child.wait()).await;
        }
        let _ = self.child.start_kill();
        self.relay.abort();
        tracing::debug!(pid = self.pid, "agent shut down");
    }
}

impl PooledBridge for Bridge {
    fn is_alive(&mut self) -> bool {
        !self.broken && !self.in_flight && matches!(self.child.try_wait(), Ok(None))
    }

    fn retire(mut self) {
        tracing::debug!(pid = self.pid, program = %self.program.display(), "retiring agent");
        let _ = self.child.start_kill();
        self.relay.abort();
    }
}

async fn relay_stderr(mut lines: OutputLines, diagnostics: SinkSlot, pid: u32) {
    while let Some((_, line)) = lines.next().await {
        let sink = diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match sink {
            Some(sink) => sink.emit(LogEntry::bridge(LogLevel::Stderr, line)).await,
            None => tracing::debug!(pid, "agent stderr: {}", line),
        }
    }
}

//! Remote command execution over the multiplexed channel websocket.
//!
//! Frames are prefixed with one channel byte: `0` stdin, `1` stdout,
//! `2` stderr, `3` error, `4` resize, and (under the v5 subprotocol only)
//! `255` close. The error channel carries a JSON `Status` whose
//! `details.causes[]` encode the remote exit code; delivery of that status
//! ends the session.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use serde_json::Value;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::{
    api::{ApiObject, AttachParams, Pod},
    client::{Status, StreamProtocol},
    Error, Result,
};

const STDIN_CHANNEL: u8 = 0;
const STDOUT_CHANNEL: u8 = 1;
const STDERR_CHANNEL: u8 = 2;
const ERROR_CHANNEL: u8 = 3;
const RESIZE_CHANNEL: u8 = 4;
const CLOSE_CHANNEL: u8 = 255;

// Exit codes for sessions that end without a well-formed status.
const CODE_BAD_STATUS: i32 = -1;
const CODE_NO_EXIT_CAUSE: i32 = -2;
const CODE_NO_EXIT_MESSAGE: i32 = -3;
const CODE_DISCONNECTED: i32 = -4;

const MAX_CONNECT_ATTEMPTS: u32 = 5;

type WsSink = SplitSink<WebSocketStream<Upgraded>, Message>;
type WsStream = SplitStream<WebSocketStream<Upgraded>>;

/// The completed result of an exec round trip, like a local process exit.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The command that ran
    pub command: Vec<String>,
    /// Captured stdout bytes
    pub stdout: Vec<u8>,
    /// Captured stderr bytes
    pub stderr: Vec<u8>,
    /// The remote exit code
    pub returncode: i32,
}

impl ExecResult {
    /// Fail with [`Error::Exec`] when the command exited non-zero.
    pub fn check_returncode(&self) -> Result<()> {
        if self.returncode != 0 {
            return Err(Error::Exec(format!(
                "command {:?} exited with status {}",
                self.command, self.returncode
            )));
        }
        Ok(())
    }

    /// Stdout as lossy UTF-8.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr as lossy UTF-8.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

enum FrameOutcome {
    Read,
    Closed,
}

struct ProcState {
    frame_count: u64,
    closed: bool,
    stdin_closed: bool,
    stdout_open: bool,
    stderr_open: bool,
    stderr2out: bool,
    stdout_frames: VecDeque<Vec<u8>>,
    stderr_frames: VecDeque<Vec<u8>>,
    returncode: Option<i32>,
    status_message: Option<String>,
}

/// A process executing remotely over a channel websocket.
///
/// Multiple readers may pull stdout/stderr concurrently; the frame pump is
/// guarded by a receive lock and a frame counter so a frame is delivered at
/// most once.
pub struct AttachedProcess {
    protocol: StreamProtocol,
    container: String,
    deadline: Option<Instant>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    recv: Arc<tokio::sync::Mutex<Option<WsStream>>>,
    state: Arc<std::sync::Mutex<ProcState>>,
}

impl AttachedProcess {
    /// Open the exec channel against `target`.
    ///
    /// A pod target is used directly; any resource that selects ready pods
    /// is round-robined over them by connection attempt. Connection failures
    /// retry up to five times with `0.2 × attempt` seconds of backoff.
    pub async fn connect(
        target: &ApiObject,
        command: &[String],
        params: &AttachParams,
    ) -> Result<AttachedProcess> {
        params.validate()?;
        let is_pod = target.class().kind == "Pod" && target.class().group.is_empty();
        let mut attempts: u32 = 0;
        loop {
            let pod = if is_pod {
                Pod(target.clone())
            } else {
                let pods = target.ready_pods().await?;
                if pods.is_empty() {
                    return Err(Error::NotFound("no ready pods found".into()));
                }
                pods[attempts as usize % pods.len()].clone()
            };
            let container = match &params.container {
                Some(c) => c.clone(),
                None => default_container(&pod)?,
            };
            let mut effective = params.clone();
            effective.container = Some(container.clone());
            let req = pod.class().exec_request(
                pod.namespace().as_deref(),
                &pod.name()?,
                command.iter().cloned(),
                &effective,
            )?;
            match pod.client()?.connect(req).await {
                Ok((socket, protocol)) => {
                    if effective.stdin && !protocol.supports_stream_close() {
                        return Err(Error::Exec(
                            "stdin streaming requires the v5 channel subprotocol \
                             (Kubernetes 1.30 or newer)"
                                .into(),
                        ));
                    }
                    let (sink, stream) = socket.split();
                    let state = ProcState {
                        frame_count: 0,
                        closed: false,
                        stdin_closed: !effective.stdin,
                        stdout_open: effective.stdout || effective.stderr2out,
                        stderr_open: effective.stderr,
                        stderr2out: effective.stderr2out,
                        stdout_frames: VecDeque::new(),
                        stderr_frames: VecDeque::new(),
                        returncode: None,
                        status_message: None,
                    };
                    return Ok(AttachedProcess {
                        protocol,
                        container,
                        deadline: effective.timeout.map(|t| Instant::now() + t),
                        sink: Arc::new(tokio::sync::Mutex::new(Some(sink))),
                        recv: Arc::new(tokio::sync::Mutex::new(Some(stream))),
                        state: Arc::new(std::sync::Mutex::new(state)),
                    });
                }
                Err(e) if is_retryable(&e) => {
                    attempts += 1;
                    if attempts > MAX_CONNECT_ATTEMPTS {
                        return Err(Error::ConnectionClosed(format!(
                            "unable to connect to pod: {}",
                            e
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(200 * u64::from(attempts))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The subprotocol the server selected.
    pub fn protocol(&self) -> StreamProtocol {
        self.protocol
    }

    /// The container the command runs in.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The remote exit code, once the error channel has delivered it.
    pub fn returncode(&self) -> Option<i32> {
        self.state.lock().expect("state lock poisoned").returncode
    }

    /// The status message from the error channel, if any.
    pub fn status_message(&self) -> Option<String> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .status_message
            .clone()
    }

    /// Whether the websocket is gone.
    pub fn closed(&self) -> bool {
        self.state.lock().expect("state lock poisoned").closed
    }

    /// Write bytes to the remote stdin.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if state.closed || state.stdin_closed {
                return Ok(());
            }
        }
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(STDIN_CHANNEL);
        frame.extend_from_slice(data);
        self.send_frame(frame).await
    }

    /// Half-close the remote stdin.
    ///
    /// Only the v5 subprotocol has a close channel; under v4 the close is
    /// elided with a warning, matching the kubelet's pre-1.30 behavior.
    pub async fn close_stdin(&self) -> Result<()> {
        let already = {
            let mut state = self.state.lock().expect("state lock poisoned");
            std::mem::replace(&mut state.stdin_closed, true)
        };
        if already || self.closed() {
            return Ok(());
        }
        if self.protocol.supports_stream_close() {
            self.send_frame(vec![CLOSE_CHANNEL, STDIN_CHANNEL]).await
        } else {
            tracing::warn!("cannot half-close stdin on {}", self.protocol.as_str());
            Ok(())
        }
    }

    /// Inform the remote process of the TTY dimensions.
    pub async fn resize(&self, width: u16, height: u16) -> Result<()> {
        if self.closed() {
            return Ok(());
        }
        let mut frame = vec![RESIZE_CHANNEL];
        frame.extend_from_slice(format!("{{\"Width\":{},\"Height\":{}}}", width, height).as_bytes());
        self.send_frame(frame).await
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(Message::Binary(frame))
                .await
                .map_err(|e| Error::ConnectionClosed(format!("websocket closed: {}", e))),
            None => Err(Error::ConnectionClosed("websocket closed".into())),
        }
    }

    /// Read the next stdout chunk; `None` at end of stream.
    pub async fn read_stdout(&self) -> Result<Option<Vec<u8>>> {
        self.read_channel(true).await
    }

    /// Read the next stderr chunk; `None` at end of stream.
    pub async fn read_stderr(&self) -> Result<Option<Vec<u8>>> {
        self.read_channel(false).await
    }

    async fn read_channel(&self, stdout: bool) -> Result<Option<Vec<u8>>> {
        loop {
            {
                let mut state = self.state.lock().expect("state lock poisoned");
                let frames = if stdout {
                    &mut state.stdout_frames
                } else {
                    &mut state.stderr_frames
                };
                if let Some(frame) = frames.pop_front() {
                    return Ok(Some(frame));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            if let FrameOutcome::Closed = self.recv_frame().await? {
                // fall through once more to drain anything buffered
                let mut state = self.state.lock().expect("state lock poisoned");
                let frames = if stdout {
                    &mut state.stdout_frames
                } else {
                    &mut state.stderr_frames
                };
                return Ok(frames.pop_front());
            }
        }
    }

    /// Write `input` to stdin (if any), close stdin, drain stdout and stderr
    /// concurrently to end of stream, wait for the exit status, and return
    /// `(stdout, stderr)`.
    pub async fn communicate(&mut self, input: Option<Vec<u8>>) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.closed() {
            return Err(Error::Validation(
                "cannot call communicate after the channel closed".into(),
            ));
        }
        if let Some(input) = input {
            self.write_stdin(&input).await?;
        }
        self.close_stdin().await?;

        let this: &AttachedProcess = &*self;
        let drain_out = async {
            let mut collected = vec![];
            while let Some(chunk) = this.read_channel(true).await? {
                collected.extend_from_slice(&chunk);
            }
            Ok::<_, Error>(collected)
        };
        let drain_err = async {
            let mut collected = vec![];
            while let Some(chunk) = this.read_channel(false).await? {
                collected.extend_from_slice(&chunk);
            }
            Ok::<_, Error>(collected)
        };
        let (stdout, stderr) = futures::future::try_join(drain_out, drain_err).await?;
        self.wait().await?;
        Ok((stdout, stderr))
    }

    /// Drive the channel until the exit status arrives; returns the code.
    pub async fn wait(&mut self) -> Result<Option<i32>> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if state.closed {
                return Ok(state.returncode);
            }
            // stop buffering output frames while we drain for the status
            state.stdout_open = false;
            state.stderr_open = false;
        }
        loop {
            if let FrameOutcome::Closed = self.recv_frame().await? {
                return Ok(self.returncode());
            }
        }
    }

    /// Close the websocket.
    pub async fn close(&mut self) {
        let mut recv = self.recv.lock().await;
        self.finish(&mut *recv, None).await;
    }

    // Tear the session down. The caller holds the receive lock, so no other
    // reader can observe a half-closed state.
    async fn finish(&self, recv: &mut Option<WsStream>, code: Option<i32>) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.closed = true;
            if state.returncode.is_none() {
                state.returncode = code;
            }
        }
        *recv = None;
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }

    fn remaining(&self) -> Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(Error::Timeout("exec read deadline exceeded".into()))
                } else {
                    Ok(Some(deadline - now))
                }
            }
        }
    }

    /// Pump one frame off the socket.
    ///
    /// Guarded by the receive lock; a reader that raced another reader for
    /// the same wakeup observes the frame counter moved and does not read a
    /// second frame.
    async fn recv_frame(&self) -> Result<FrameOutcome> {
        let count_before = self
            .state
            .lock()
            .expect("state lock poisoned")
            .frame_count;
        let mut recv = self.recv.lock().await;
        {
            let state = self.state.lock().expect("state lock poisoned");
            if state.frame_count != count_before {
                return Ok(FrameOutcome::Read);
            }
            if state.closed {
                return Ok(FrameOutcome::Closed);
            }
        }
        let stream = match recv.as_mut() {
            Some(s) => s,
            None => return Ok(FrameOutcome::Closed),
        };
        let next = match self.remaining()? {
            Some(remaining) => match tokio::time::timeout(remaining, stream.next()).await {
                Ok(next) => next,
                Err(_) => return Err(Error::Timeout("exec read deadline exceeded".into())),
            },
            None => stream.next().await,
        };
        // Process before releasing the receive lock so concurrent readers
        // cannot reorder frames.
        match next {
            Some(Ok(Message::Binary(frame))) => {
                if frame.first() == Some(&ERROR_CHANNEL) {
                    let code = self.parse_exit_status(&frame[1..]);
                    self.finish(&mut *recv, Some(code)).await;
                    return Ok(FrameOutcome::Closed);
                }
                self.buffer_frame(frame);
                Ok(FrameOutcome::Read)
            }
            Some(Ok(Message::Ping(_)))
            | Some(Ok(Message::Pong(_)))
            | Some(Ok(Message::Text(_))) => Ok(FrameOutcome::Read),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                self.finish(&mut *recv, Some(CODE_DISCONNECTED)).await;
                Ok(FrameOutcome::Closed)
            }
        }
    }

    fn buffer_frame(&self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        let channel = frame[0];
        if channel != STDOUT_CHANNEL && channel != STDERR_CHANNEL {
            return;
        }
        let mut state = self.state.lock().expect("state lock poisoned");
        if frame.len() > 1 {
            let payload = frame[1..].to_vec();
            if channel == STDOUT_CHANNEL {
                if state.stdout_open {
                    state.stdout_frames.push_back(payload);
                }
            } else if state.stderr2out {
                if state.stdout_open {
                    state.stdout_frames.push_back(payload);
                }
            } else if state.stderr_open {
                state.stderr_frames.push_back(payload);
            }
        }
        state.frame_count += 1;
    }

    fn parse_exit_status(&self, payload: &[u8]) -> i32 {
        let looks_like_json =
            payload.len() > 1 && payload[0] == b'{' && payload[payload.len() - 1] == b'}';
        if looks_like_json {
            if let Ok(status) = serde_json::from_slice::<Status>(payload) {
                {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    state.status_message = if status.message.is_empty() {
                        None
                    } else {
                        Some(status.message.clone())
                    };
                }
                if status.status == "Success" {
                    return 0;
                }
                let causes = status.details.map(|d| d.causes).unwrap_or_default();
                for cause in causes {
                    if cause.reason == "ExitCode" {
                        return cause.message.parse().unwrap_or(CODE_NO_EXIT_MESSAGE);
                    }
                }
                return CODE_NO_EXIT_CAUSE;
            }
        }
        let text = String::from_utf8_lossy(payload).into_owned();
        let mut state = self.state.lock().expect("state lock poisoned");
        state.status_message = Some(text);
        CODE_BAD_STATUS
    }
}

fn is_retryable(e: &Error) -> bool {
    matches!(
        e,
        Error::ConnectionClosed(_)
            | Error::HyperError(_)
            | Error::Service(_)
            | Error::ProtocolSwitch(_)
            | Error::MissingUpgradeWebSocketHeader
            | Error::MissingConnectionUpgradeHeader
            | Error::SecWebSocketAcceptKeyMismatch
            | Error::ApiTimeout(_)
    )
}

/// The container an exec lands in when the caller does not pick one:
/// the `default-container` annotation, then the first container in the spec.
fn default_container(pod: &Pod) -> Result<String> {
    if let Some(annotated) = pod
        .annotations()
        .get("kubectl.kubernetes.io/default-container")
        .and_then(Value::as_str)
    {
        return Ok(annotated.to_string());
    }
    pod.spec()
        .pointer("/containers/0/name")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::Validation("pod has no containers".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process_with_state() -> AttachedProcess {
        AttachedProcess {
            protocol: StreamProtocol::V5,
            container: "main".into(),
            deadline: None,
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            recv: Arc::new(tokio::sync::Mutex::new(None)),
            state: Arc::new(std::sync::Mutex::new(ProcState {
                frame_count: 0,
                closed: false,
                stdin_closed: false,
                stdout_open: true,
                stderr_open: true,
                stderr2out: false,
                stdout_frames: VecDeque::new(),
                stderr_frames: VecDeque::new(),
                returncode: None,
                status_message: None,
            })),
        }
    }

    #[test]
    fn exit_status_success_is_zero() {
        let proc = process_with_state();
        let payload = serde_json::to_vec(&json!({ "status": "Success" })).unwrap();
        assert_eq!(proc.parse_exit_status(&payload), 0);
    }

    #[test]
    fn exit_status_reads_exit_code_cause() {
        let proc = process_with_state();
        let payload = serde_json::to_vec(&json!({
            "status": "Failure",
            "message": "command terminated with non-zero exit code",
            "reason": "NonZeroExitCode",
            "details": { "causes": [
                { "reason": "Other", "message": "x" },
                { "reason": "ExitCode", "message": "7" },
            ]},
        }))
        .unwrap();
        assert_eq!(proc.parse_exit_status(&payload), 7);
        assert!(proc.status_message().is_some());
    }

    #[test]
    fn exit_status_without_cause_is_minus_two() {
        let proc = process_with_state();
        let payload =
            serde_json::to_vec(&json!({ "status": "Failure", "reason": "InternalError" }))
                .unwrap();
        assert_eq!(proc.parse_exit_status(&payload), CODE_NO_EXIT_CAUSE);
    }

    #[test]
    fn non_json_exit_status_is_minus_one() {
        let proc = process_with_state();
        assert_eq!(proc.parse_exit_status(b"garbled"), CODE_BAD_STATUS);
        assert_eq!(proc.status_message().as_deref(), Some("garbled"));
    }

    #[tokio::test]
    async fn frames_route_to_channel_buffers() {
        let proc = process_with_state();
        let mut frame = vec![STDOUT_CHANNEL];
        frame.extend_from_slice(b"out");
        proc.buffer_frame(frame);
        let mut frame = vec![STDERR_CHANNEL];
        frame.extend_from_slice(b"err");
        proc.buffer_frame(frame);

        {
            let state = proc.state.lock().unwrap();
            assert_eq!(state.stdout_frames[0], b"out");
            assert_eq!(state.stderr_frames[0], b"err");
            assert_eq!(state.frame_count, 2);
        }
        assert_eq!(proc.read_stdout().await.unwrap(), Some(b"out".to_vec()));
        assert_eq!(proc.read_stderr().await.unwrap(), Some(b"err".to_vec()));
    }

    #[test]
    fn stderr2out_merges_streams() {
        let proc = process_with_state();
        {
            let mut state = proc.state.lock().unwrap();
            state.stderr2out = true;
            state.stderr_open = false;
        }
        let mut frame = vec![STDERR_CHANNEL];
        frame.extend_from_slice(b"err");
        proc.buffer_frame(frame);
        let state = proc.state.lock().unwrap();
        assert_eq!(state.stdout_frames[0], b"err");
        assert!(state.stderr_frames.is_empty());
    }

    #[test]
    fn closed_channels_drop_frames() {
        let proc = process_with_state();
        {
            let mut state = proc.state.lock().unwrap();
            state.stdout_open = false;
        }
        let mut frame = vec![STDOUT_CHANNEL];
        frame.extend_from_slice(b"late");
        proc.buffer_frame(frame);
        let state = proc.state.lock().unwrap();
        assert!(state.stdout_frames.is_empty());
        // the wakeup still counts so blocked readers re-check their buffers
        assert_eq!(state.frame_count, 1);
    }

    #[tokio::test]
    async fn readers_drain_buffers_after_close() {
        let proc = process_with_state();
        let mut frame = vec![STDOUT_CHANNEL];
        frame.extend_from_slice(b"tail");
        proc.buffer_frame(frame);
        {
            let mut recv = proc.recv.lock().await;
            proc.finish(&mut *recv, Some(0)).await;
        }
        assert!(proc.closed());
        assert_eq!(proc.returncode(), Some(0));
        // buffered output survives the close
        assert_eq!(proc.read_stdout().await.unwrap(), Some(b"tail".to_vec()));
        assert_eq!(proc.read_stdout().await.unwrap(), None);
    }
}

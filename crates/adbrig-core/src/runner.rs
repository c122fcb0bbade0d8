//! Asynchronous adb process supervision.
//!
//! One runner owns at most one live adb invocation. Two reader tasks forward
//! raw decoded output chunks over an mpsc channel; a supervision task is the
//! only writer of session state and emits typed events on the runner's event
//! channel. `Terminal` is emitted last, after the process exited and the
//! output pipes drained (bounded by a short grace period, since a leaked
//! grandchild can hold a pipe open past the kill of its parent).

use std::{
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    sync::{mpsc, watch},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::{
    config::AdbConfig,
    event::{AdbEvent, ExecOutcome, TransferDirection},
    parse,
    progress::TransferTracker,
};

pub const EVENT_CHANNEL_CAPACITY: usize = 256;
const CHUNK_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK_BYTES: usize = 4096;
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum AdbError {
    /// `execute` was called while a previous invocation is still live. The
    /// runner does not auto-serialize commands.
    SessionActive,
}

impl std::fmt::Display for AdbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdbError::SessionActive => write!(f, "an adb command is already running"),
        }
    }
}

impl std::error::Error for AdbError {}

/// Receiving half of a runner's event channel.
pub struct AdbEvents(mpsc::Receiver<AdbEvent>);

impl AdbEvents {
    pub async fn recv(&mut self) -> Option<AdbEvent> {
        self.0.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<AdbEvent> {
        ReceiverStream::new(self.0)
    }
}

#[derive(Default)]
struct SessionOutput {
    stdout: String,
    stderr: String,
}

#[derive(Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

struct OutputChunk {
    stream: OutputStream,
    text: String,
}

pub struct AdbRunner {
    config: Arc<AdbConfig>,
    events: mpsc::Sender<AdbEvent>,
    output: Arc<Mutex<SessionOutput>>,
    running: Arc<AtomicBool>,
    kill_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl AdbRunner {
    pub fn new(config: Arc<AdbConfig>) -> (Self, AdbEvents) {
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let runner = Self {
            config,
            events,
            output: Arc::new(Mutex::new(SessionOutput::default())),
            running: Arc::new(AtomicBool::new(false)),
            kill_tx: Mutex::new(None),
        };
        (runner, AdbEvents(event_rx))
    }

    /// Run one adb invocation. The outcome arrives as events; the only
    /// `Err` here is calling this while a session is still live.
    pub async fn execute(
        &self,
        serial: &str,
        args: &[String],
        transfer: TransferDirection,
    ) -> Result<(), AdbError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AdbError::SessionActive);
        }

        {
            let mut output = self.output.lock().unwrap();
            output.stdout.clear();
            output.stderr.clear();
        }

        let full_args = session_args(serial, args);
        let adb = self.config.adb_path().to_path_buf();
        self.log(format!("exec: {} {}", adb.display(), full_args.join(" ")))
            .await;

        let mut command = self.build_command(&adb, &full_args, transfer).await;
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let outcome = if err.kind() == io::ErrorKind::NotFound {
                    ExecOutcome::MissingBinary
                } else {
                    warn!("failed to start adb: {err}");
                    self.log(format!(
                        "start error: {} {}",
                        adb.display(),
                        full_args.join(" ")
                    ))
                    .await;
                    ExecOutcome::StartFailed
                };
                self.running.store(false, Ordering::SeqCst);
                let _ = self.events.send(AdbEvent::Terminal(outcome)).await;
                return Ok(());
            }
        };

        let _ = self.events.send(AdbEvent::Started).await;

        let (kill_tx, kill_rx) = watch::channel(false);
        *self.kill_tx.lock().unwrap() = Some(kill_tx);

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_chunks(stdout, OutputStream::Stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_chunks(stderr, OutputStream::Stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);

        tokio::spawn(supervise(
            child,
            chunk_rx,
            kill_rx,
            TransferTracker::new(transfer),
            Arc::clone(&self.output),
            Arc::clone(&self.running),
            self.events.clone(),
        ));

        Ok(())
    }

    /// Whether a session is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fire-and-forget termination; observed through the terminal event.
    /// There is no distinct cancelled outcome.
    pub fn kill(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().unwrap().as_ref() {
            let _ = kill_tx.send(true);
        }
    }

    pub fn stdout(&self) -> String {
        self.output.lock().unwrap().stdout.clone()
    }

    pub fn stderr(&self) -> String {
        self.output.lock().unwrap().stderr.clone()
    }

    /// Serials parsed from a finished `devices` invocation.
    pub fn device_serials(&self) -> Vec<String> {
        parse::device_serials(&self.stdout())
    }

    /// Address parsed from a finished `shell ifconfig` invocation.
    pub fn device_ip_from_ifconfig(&self) -> Option<String> {
        parse::ifconfig_ip(&self.stdout())
    }

    /// Address parsed from a finished `shell ip addr` invocation.
    pub fn device_ip_from_ip_cmd(&self) -> Option<String> {
        parse::ip_cmd_ip(&self.stdout())
    }

    pub async fn devices(&self) -> Result<(), AdbError> {
        self.execute("", &strings(&["devices"]), TransferDirection::None)
            .await
    }

    pub async fn push(&self, serial: &str, local: &str, remote: &str) -> Result<(), AdbError> {
        self.execute(
            serial,
            &strings(&["push", "-p", local, remote]),
            TransferDirection::Push,
        )
        .await
    }

    pub async fn pull(&self, serial: &str, remote: &str, local: &str) -> Result<(), AdbError> {
        self.execute(
            serial,
            &strings(&["pull", "-p", remote, local]),
            TransferDirection::Pull,
        )
        .await
    }

    pub async fn install(&self, serial: &str, apk: &str) -> Result<(), AdbError> {
        self.execute(
            serial,
            &strings(&["install", "-r", apk]),
            TransferDirection::None,
        )
        .await
    }

    pub async fn remove_path(&self, serial: &str, path: &str) -> Result<(), AdbError> {
        self.execute(serial, &strings(&["shell", "rm", path]), TransferDirection::None)
            .await
    }

    pub async fn forward(
        &self,
        serial: &str,
        local_port: u16,
        socket_name: &str,
    ) -> Result<(), AdbError> {
        let args = vec![
            "forward".to_string(),
            format!("tcp:{local_port}"),
            format!("localabstract:{socket_name}"),
        ];
        self.execute(serial, &args, TransferDirection::None).await
    }

    pub async fn forward_remove(&self, serial: &str, local_port: u16) -> Result<(), AdbError> {
        let args = vec![
            "forward".to_string(),
            "--remove".to_string(),
            format!("tcp:{local_port}"),
        ];
        self.execute(serial, &args, TransferDirection::None).await
    }

    pub async fn reverse(
        &self,
        serial: &str,
        socket_name: &str,
        local_port: u16,
    ) -> Result<(), AdbError> {
        let args = vec![
            "reverse".to_string(),
            format!("localabstract:{socket_name}"),
            format!("tcp:{local_port}"),
        ];
        self.execute(serial, &args, TransferDirection::None).await
    }

    pub async fn reverse_remove(&self, serial: &str, socket_name: &str) -> Result<(), AdbError> {
        let args = vec![
            "reverse".to_string(),
            "--remove".to_string(),
            format!("localabstract:{socket_name}"),
        ];
        self.execute(serial, &args, TransferDirection::None).await
    }

    pub async fn set_show_touches(&self, serial: &str, enabled: bool) -> Result<(), AdbError> {
        let value = if enabled { "1" } else { "0" };
        self.execute(
            serial,
            &strings(&["shell", "settings", "put", "system", "show_touches", value]),
            TransferDirection::None,
        )
        .await
    }

    pub async fn shell(&self, serial: &str, command: &[&str]) -> Result<(), AdbError> {
        let mut args = vec!["shell".to_string()];
        args.extend(command.iter().map(|part| part.to_string()));
        self.execute(serial, &args, TransferDirection::None).await
    }

    /// Transfers go through the pseudo-terminal helper when it exists, so
    /// adb emits fine-grained progress text. Everything else runs direct.
    async fn build_command(
        &self,
        adb: &Path,
        args: &[String],
        transfer: TransferDirection,
    ) -> Command {
        if transfer.is_transfer() {
            if let Some(helper) = self.config.pty_helper() {
                self.log(format!(
                    "exec via script pty: {} -q /dev/null {} {}",
                    helper.display(),
                    adb.display(),
                    args.join(" ")
                ))
                .await;
                let mut command = Command::new(helper);
                command.arg("-q").arg("/dev/null").arg(adb).args(args);
                return command;
            }
            if let Some(helper) = self.config.pty_helper_configured() {
                self.log(format!(
                    "script not found at {}, fallback without pty",
                    helper.display()
                ))
                .await;
            }
        }
        let mut command = Command::new(adb);
        command.args(args);
        command
    }

    async fn log(&self, line: String) {
        let _ = self.events.send(AdbEvent::Log(line)).await;
    }
}

fn session_args(serial: &str, args: &[String]) -> Vec<String> {
    let mut full = Vec::with_capacity(args.len() + 2);
    if !serial.is_empty() {
        full.push("-s".to_string());
        full.push(serial.to_string());
    }
    full.extend(args.iter().cloned());
    full
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

async fn read_chunks<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                if tx.send(OutputChunk { stream, text }).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_chunk(
    chunk: OutputChunk,
    tracker: &mut TransferTracker,
    output: &Arc<Mutex<SessionOutput>>,
    events: &mpsc::Sender<AdbEvent>,
) {
    {
        let mut session = output.lock().unwrap();
        match chunk.stream {
            OutputStream::Stdout => session.stdout.push_str(&chunk.text),
            OutputStream::Stderr => session.stderr.push_str(&chunk.text),
        }
    }
    let _ = events.send(AdbEvent::Log(chunk.text.clone())).await;
    // Both streams feed the tracker; adb does not separate progress text
    // from error text.
    if let Some(update) = tracker.push_chunk(&chunk.text) {
        let _ = events
            .send(AdbEvent::Progress {
                download: update.download,
                percent: update.percent,
            })
            .await;
        let _ = events
            .send(AdbEvent::Log(format!(
                "transfer progress: {}%",
                update.percent
            )))
            .await;
    }
}

async fn supervise(
    mut child: Child,
    mut chunk_rx: mpsc::Receiver<OutputChunk>,
    mut kill_rx: watch::Receiver<bool>,
    mut tracker: TransferTracker,
    output: Arc<Mutex<SessionOutput>>,
    running: Arc<AtomicBool>,
    events: mpsc::Sender<AdbEvent>,
) {
    let mut drained = false;
    let mut kill_closed = false;
    let mut status: Option<Result<ExitStatus, io::Error>> = None;

    while status.is_none() {
        tokio::select! {
            changed = kill_rx.changed(), if !kill_closed => {
                match changed {
                    Ok(()) => {
                        if *kill_rx.borrow_and_update() {
                            let _ = events.send(AdbEvent::Log("kill requested".to_string())).await;
                            if let Err(err) = child.kill().await {
                                warn!("failed to kill adb: {err}");
                            }
                            kill_closed = true;
                        }
                    }
                    Err(_) => kill_closed = true,
                }
            }
            chunk = chunk_rx.recv(), if !drained => {
                match chunk {
                    Some(chunk) => handle_chunk(chunk, &mut tracker, &output, &events).await,
                    None => drained = true,
                }
            }
            result = child.wait() => status = Some(result),
        }
    }

    if !drained {
        while let Ok(Some(chunk)) = tokio::time::timeout(DRAIN_GRACE, chunk_rx.recv()).await {
            handle_chunk(chunk, &mut tracker, &output, &events).await;
        }
    }

    let outcome = match status {
        Some(Ok(exit)) if exit.success() => ExecOutcome::Succeeded,
        Some(Ok(exit)) => {
            debug!("adb exited with code {:?}", exit.code());
            ExecOutcome::ExitedWithError
        }
        Some(Err(err)) => {
            warn!("waiting for adb failed: {err}");
            ExecOutcome::ExitedWithError
        }
        None => ExecOutcome::ExitedWithError,
    };

    // No progress state survives the invocation, whatever the outcome.
    tracker.reset();
    running.store(false, Ordering::SeqCst);
    let _ = events.send(AdbEvent::Terminal(outcome)).await;
}

/// One-shot blocking directory listing with its own throwaway process,
/// bounded by the configured timeout. Runs outside the session model and
/// never touches a runner's state. Empty on timeout or failure.
pub async fn list_remote_files(config: &AdbConfig, serial: &str, path: &str) -> Vec<String> {
    let mut command = Command::new(config.adb_path());
    if !serial.is_empty() {
        command.arg("-s").arg(serial);
    }
    command.arg("shell").arg("ls").arg("-1").arg(path);
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(config.list_timeout(), command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            parse::ls_entries(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(Ok(output)) => {
            warn!(
                "remote listing failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Vec::new()
        }
        Ok(Err(err)) => {
            warn!("remote listing failed to run: {err}");
            Vec::new()
        }
        Err(_) => {
            warn!(
                "remote listing timed out after {:?}",
                config.list_timeout()
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_serial_omits_selector_pair() {
        let args = session_args("", &strings(&["devices"]));
        assert_eq!(args, vec!["devices".to_string()]);
    }

    #[test]
    fn serial_prefixes_selector_pair() {
        let args = session_args("abc123", &strings(&["shell", "rm", "/sdcard/x"]));
        assert_eq!(
            args,
            vec![
                "-s".to_string(),
                "abc123".to_string(),
                "shell".to_string(),
                "rm".to_string(),
                "/sdcard/x".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::sync::atomic::AtomicU32;

        fn fake_tool(body: &str) -> std::path::PathBuf {
            use std::os::unix::fs::PermissionsExt;
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            let n = COUNTER.fetch_add(1, Ordering::SeqCst);
            let path = std::env::temp_dir().join(format!(
                "adbrig-fake-{}-{n}.sh",
                std::process::id()
            ));
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn config_for(tool: &std::path::Path) -> Arc<AdbConfig> {
            Arc::new(AdbConfig::with_path(tool).without_pty_helper())
        }

        async fn drain(events: &mut AdbEvents) -> (Vec<AdbEvent>, ExecOutcome) {
            let mut seen = Vec::new();
            loop {
                let event = events.recv().await.expect("event channel closed early");
                if let AdbEvent::Terminal(outcome) = &event {
                    let outcome = *outcome;
                    seen.push(event);
                    return (seen, outcome);
                }
                seen.push(event);
            }
        }

        #[tokio::test]
        async fn success_accumulates_output_and_parses_serials() {
            let tool = fake_tool(
                "printf 'List of devices attached\\nabc123\\tdevice\\nzzz999\\toffline\\n'",
            );
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.devices().await.unwrap();

            let (seen, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::Succeeded);
            assert!(matches!(seen.first(), Some(AdbEvent::Log(line)) if line.starts_with("exec: ")));
            assert!(seen.contains(&AdbEvent::Started));
            assert_eq!(runner.device_serials(), vec!["abc123".to_string()]);
            assert!(runner.stdout().contains("List of devices attached"));
            assert!(!runner.is_running());
        }

        #[tokio::test]
        async fn missing_binary_is_distinguished() {
            let config = Arc::new(
                AdbConfig::with_path("/nonexistent/adbrig-no-such-tool").without_pty_helper(),
            );
            let (runner, mut events) = AdbRunner::new(config);
            runner.devices().await.unwrap();

            let (seen, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::MissingBinary);
            assert!(!seen.contains(&AdbEvent::Started));
            assert!(!runner.is_running());
        }

        #[tokio::test]
        async fn non_zero_exit_reports_error_with_stderr() {
            let tool = fake_tool("printf 'adb: no devices found\\n' >&2; exit 7");
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.devices().await.unwrap();

            let (_, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::ExitedWithError);
            assert!(runner.stderr().contains("no devices found"));
        }

        #[tokio::test]
        async fn concurrent_execute_is_a_caller_error() {
            let tool = fake_tool("sleep 2");
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.devices().await.unwrap();
            assert!(runner.is_running());
            assert!(matches!(
                runner.devices().await,
                Err(AdbError::SessionActive)
            ));

            runner.kill();
            let (_, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::ExitedWithError);
            assert!(!runner.is_running());
        }

        #[tokio::test]
        async fn push_streams_deduplicated_progress() {
            let tool = fake_tool(
                "printf '[ 10%%] f\\r'; sleep 0.2; printf '[ 55%%] f\\r'; sleep 0.2; printf '[100%%] f\\n'",
            );
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.push("serial1", "/tmp/f.bin", "/sdcard/f.bin").await.unwrap();

            let (seen, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::Succeeded);
            let progress: Vec<u8> = seen
                .iter()
                .filter_map(|event| match event {
                    AdbEvent::Progress { download, percent } => {
                        assert!(!download);
                        Some(*percent)
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(progress.last(), Some(&100));
            assert!(progress.windows(2).all(|pair| pair[0] != pair[1]));
            assert!(progress.iter().all(|p| [10, 55, 100].contains(p)));
        }

        #[tokio::test]
        async fn pull_progress_is_flagged_as_download() {
            let tool = fake_tool("printf '12 MB/s (1024/1024)\\n'");
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.pull("serial1", "/sdcard/f.bin", "/tmp/f.bin").await.unwrap();

            let (seen, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::Succeeded);
            assert!(seen.contains(&AdbEvent::Progress {
                download: true,
                percent: 100
            }));
        }

        #[tokio::test]
        async fn kill_mid_transfer_surfaces_generic_error() {
            let tool = fake_tool("printf '[ 42%%] f\\n'; sleep 30");
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.push("serial1", "/tmp/f.bin", "/sdcard/f.bin").await.unwrap();

            loop {
                match events.recv().await.expect("event channel closed early") {
                    AdbEvent::Progress { percent: 42, .. } => break,
                    AdbEvent::Terminal(outcome) => panic!("terminated early: {outcome:?}"),
                    _ => {}
                }
            }
            runner.kill();

            let (_, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::ExitedWithError);
            assert!(!runner.is_running());
        }

        #[tokio::test]
        async fn runner_is_reusable_after_terminal() {
            let tool = fake_tool("printf 'first\\n'");
            let (runner, mut events) = AdbRunner::new(config_for(&tool));
            runner.devices().await.unwrap();
            let (_, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::Succeeded);

            runner.devices().await.unwrap();
            let (_, outcome) = drain(&mut events).await;
            assert_eq!(outcome, ExecOutcome::Succeeded);
            // The second session's accumulator starts clean.
            assert_eq!(runner.stdout().matches("first").count(), 1);
        }

        #[tokio::test]
        async fn remote_listing_filters_synthetic_entries() {
            let tool = fake_tool("printf 'total 16\\n.\\n..\\nDCIM\\nDownload\\n'");
            let config = AdbConfig::with_path(&tool).without_pty_helper();
            let entries = list_remote_files(&config, "serial1", "/sdcard").await;
            assert_eq!(entries, vec!["DCIM".to_string(), "Download".to_string()]);
        }

        #[tokio::test]
        async fn remote_listing_times_out_to_empty() {
            let tool = fake_tool("sleep 30");
            let config = AdbConfig::with_path(&tool)
                .without_pty_helper()
                .with_list_timeout(Duration::from_millis(200));
            let started = std::time::Instant::now();
            let entries = list_remote_files(&config, "", "/sdcard").await;
            assert!(entries.is_empty());
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn remote_listing_failure_is_empty() {
            let tool = fake_tool("exit 1");
            let config = AdbConfig::with_path(&tool).without_pty_helper();
            let entries = list_remote_files(&config, "", "/sdcard").await;
            assert!(entries.is_empty());
        }
    }
}

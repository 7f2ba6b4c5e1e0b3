//! File-IPC adapter (MT4-style).
//!
//! MT4 terminals cannot load the 64-bit transport DLL, so the EA exchanges
//! everything through a shared directory: leader events and heartbeats are
//! appended to `events.jsonl` (tailed on a poll interval), each command is
//! written as `cmd_<id>.json` and answered by the terminal with
//! `rsp_<id>.json`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::TransportError;
use crate::models::{AccountSnapshot, CommandResponse, CopyCommand, Platform, TradeEvent};
use crate::protocol::{decode_frame, encode_frame, BusFrame};

use super::{ConnectionHealth, PlatformAdapter};

const EVENTS_FILE: &str = "events.jsonl";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Withdraws the IPC files of a round-trip that never completed. Once a
/// command file exists the terminal will execute it whenever it gets around
/// to polling, so an exchange abandoned mid-flight (engine timeout) must take
/// the file back: the attempt has already been recorded as failed, and a late
/// execution would open a position nothing tracks.
struct IpcCleanup {
    cmd_path: PathBuf,
    rsp_path: PathBuf,
    armed: bool,
}

impl Drop for IpcCleanup {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.cmd_path);
            let _ = std::fs::remove_file(&self.rsp_path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileIpcConfig {
    /// Directory shared with the terminal EA
    pub dir: PathBuf,

    /// How often the events file is polled for new lines
    pub poll_interval: Duration,
}

impl FileIpcConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct FileIpcAdapter {
    account_id: String,
    config: FileIpcConfig,
    health: Arc<ConnectionHealth>,
    subscriber: Mutex<Option<mpsc::Sender<TradeEvent>>>,
    running: AtomicBool,
}

impl FileIpcAdapter {
    pub fn new(account_id: &str, config: FileIpcConfig) -> Arc<Self> {
        Arc::new(Self {
            account_id: account_id.to_string(),
            config,
            health: ConnectionHealth::new(),
            subscriber: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    fn events_path(&self) -> PathBuf {
        self.config.dir.join(EVENTS_FILE)
    }

    async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match decode_frame(line) {
            Ok(BusFrame::Trade(wire)) => {
                self.health.touch();
                let tx = self
                    .subscriber
                    .lock()
                    .expect("subscriber lock poisoned")
                    .clone();
                if let Some(tx) = tx {
                    if tx.send(wire.into()).await.is_err() {
                        self.running.store(false, Ordering::SeqCst);
                    }
                }
            }
            Ok(BusFrame::Heartbeat { .. }) => self.health.touch(),
            Ok(other) => {
                warn!(account = %self.account_id, frame = ?other, "unexpected frame in events file");
            }
            Err(e) => {
                warn!(account = %self.account_id, error = %e, "dropping malformed events line");
            }
        }
    }

    /// Write a command file and poll for the matching response file. The
    /// engine bounds the total round-trip with its own timeout; this loop
    /// polls until the reply shows up or the adapter stops.
    async fn file_round_trip(&self, frame: &BusFrame) -> Result<BusFrame, TransportError> {
        if !self.health.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let id = Uuid::new_v4();
        let cmd_path = self.config.dir.join(format!("cmd_{id}.json"));
        let rsp_path = self.config.dir.join(format!("rsp_{id}.json"));

        // Write to a temp name then rename so the terminal never reads a
        // partially written command.
        let tmp_path = self.config.dir.join(format!("cmd_{id}.tmp"));
        fs::write(&tmp_path, encode_frame(frame)?).await?;
        fs::rename(&tmp_path, &cmd_path).await?;

        let mut cleanup = IpcCleanup {
            cmd_path: cmd_path.clone(),
            rsp_path: rsp_path.clone(),
            armed: true,
        };

        debug!(account = %self.account_id, path = %cmd_path.display(), "command file written");

        let reply = loop {
            match fs::read_to_string(&rsp_path).await {
                Ok(contents) => break contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tokio::time::sleep(RESPONSE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        };

        let _ = fs::remove_file(&rsp_path).await;
        let _ = fs::remove_file(&cmd_path).await;
        cleanup.armed = false;

        self.health.touch();
        decode_frame(&reply)
    }

    /// Drop command/response files orphaned by a previous run.
    async fn sweep_stale_files(&self) -> Result<(), TransportError> {
        let mut entries = fs::read_dir(&self.config.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if (name.starts_with("cmd_") || name.starts_with("rsp_"))
                && (name.ends_with(".json") || name.ends_with(".tmp"))
            {
                debug!(file = %name, "removing stale IPC file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for FileIpcAdapter {
    fn platform(&self) -> Platform {
        Platform::Mt4
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn connect(&self) -> Result<(), TransportError> {
        fs::create_dir_all(&self.config.dir).await?;
        self.sweep_stale_files().await?;

        // Touch the events file so tailing starts from a known state
        if fs::metadata(self.events_path()).await.is_err() {
            fs::write(self.events_path(), b"").await?;
        }

        self.health.mark_connected();
        info!(account = %self.account_id, dir = %self.config.dir.display(), "file IPC connected");
        Ok(())
    }

    fn subscribe(&self, tx: mpsc::Sender<TradeEvent>) {
        *self.subscriber.lock().expect("subscriber lock poisoned") = Some(tx);
    }

    async fn run_event_loop(&self) -> Result<(), TransportError> {
        if !self.health.is_connected() {
            self.connect().await?;
        }
        self.running.store(true, Ordering::SeqCst);

        // Events written before this run are handled by reconciliation, not
        // replay; tail from the current end of file.
        let mut offset = fs::metadata(self.events_path()).await?.len();

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.config.poll_interval).await;

            let mut file = match fs::File::open(self.events_path()).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.health.mark_disconnected();
                    return Err(TransportError::ConnectFailed(
                        "events file removed".to_string(),
                    ));
                }
                Err(e) => return Err(TransportError::Io(e)),
            };

            let len = file.metadata().await?.len();

            // Truncated file means the terminal rotated it; start over
            if len < offset {
                offset = 0;
            }

            if len == offset {
                continue;
            }

            // Read only the bytes appended since the last poll
            file.seek(SeekFrom::Start(offset)).await?;
            let mut new_bytes = Vec::with_capacity((len - offset) as usize);
            file.take(len - offset).read_to_end(&mut new_bytes).await?;

            // Only consume up to the last complete line; a partial tail is
            // re-read on the next poll.
            let consumed = match new_bytes.iter().rposition(|b| *b == b'\n') {
                Some(pos) => pos + 1,
                None => continue,
            };

            let chunk = String::from_utf8_lossy(&new_bytes[..consumed]).into_owned();
            offset += consumed as u64;

            for line in chunk.lines() {
                self.handle_line(line).await;
            }
        }

        Ok(())
    }

    async fn send_command(&self, cmd: &CopyCommand) -> Result<CommandResponse, TransportError> {
        match self.file_round_trip(&BusFrame::Command(cmd.clone())).await? {
            BusFrame::Response(resp) => Ok(resp),
            other => Err(TransportError::ProtocolMismatch(format!(
                "expected response frame, got {other:?}"
            ))),
        }
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, TransportError> {
        let query = BusFrame::Status {
            account: self.account_id.clone(),
        };
        match self.file_round_trip(&query).await? {
            BusFrame::Snapshot(snap) => Ok(snap),
            other => Err(TransportError::ProtocolMismatch(format!(
                "expected snapshot frame, got {other:?}"
            ))),
        }
    }

    async fn disconnect(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.health.mark_disconnected();
        info!(account = %self.account_id, "file IPC disconnected");
    }

    fn health(&self) -> Arc<ConnectionHealth> {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::io::AsyncWriteExt;

    use crate::models::{TradeAction, TradeEventKind};
    use crate::protocol::WireTradeEvent;

    fn wire_event(ticket: i64) -> BusFrame {
        BusFrame::Trade(WireTradeEvent {
            event: TradeEventKind::Open,
            ticket,
            symbol: "GBPJPY".to_string(),
            side: TradeAction::Sell,
            volume: dec!(0.3),
            price: dec!(187.501),
            profit: None,
            magic: Some(5),
            time: Utc::now(),
            account: "44001".to_string(),
        })
    }

    #[tokio::test]
    async fn test_tails_only_new_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileIpcConfig {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(20),
        };

        // A line written before connect must not be replayed
        let events = dir.path().join(EVENTS_FILE);
        fs::write(&events, encode_frame(&wire_event(1)).unwrap())
            .await
            .unwrap();

        let adapter = FileIpcAdapter::new("44001", config);
        adapter.connect().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        adapter.subscribe(tx);

        let loop_adapter = adapter.clone();
        let handle = tokio::spawn(async move { loop_adapter.run_event_loop().await });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&events)
            .await
            .unwrap();
        file.write_all(encode_frame(&wire_event(2)).unwrap().as_bytes())
            .await
            .unwrap();
        file.write_all(encode_frame(&wire_event(3)).unwrap().as_bytes())
            .await
            .unwrap();
        file.flush().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.leader_ticket, 2);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.leader_ticket, 3);

        adapter.disconnect().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_command_round_trip_via_files() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileIpcAdapter::new(
            "44001",
            FileIpcConfig {
                dir: dir.path().to_path_buf(),
                poll_interval: Duration::from_millis(20),
            },
        );
        adapter.connect().await.unwrap();

        // Terminal side: watch for a command file, answer it
        let dir_path = dir.path().to_path_buf();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut entries = fs::read_dir(&dir_path).await.unwrap();
                while let Some(entry) = entries.next_entry().await.unwrap() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if let Some(id) = name
                        .strip_prefix("cmd_")
                        .and_then(|s| s.strip_suffix(".json"))
                    {
                        let reply = BusFrame::Response(CommandResponse {
                            success: true,
                            ticket: Some(31337),
                            price: Some(dec!(187.490)),
                            filled_volume: None,
                            error: None,
                        });
                        fs::write(
                            dir_path.join(format!("rsp_{id}.json")),
                            encode_frame(&reply).unwrap(),
                        )
                        .await
                        .unwrap();
                        return;
                    }
                }
            }
        });

        let cmd = CopyCommand {
            leader_ticket: 2,
            symbol: "GBPJPY".to_string(),
            action: TradeAction::Buy,
            kind: TradeEventKind::Open,
            volume: dec!(0.3),
            price: dec!(187.501),
            magic: None,
            comment: CopyCommand::comment_tag(2),
        };

        let resp = adapter.send_command(&cmd).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.ticket, Some(31337));

        // Both IPC files are cleaned up after the exchange
        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![EVENTS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_abandoned_command_withdraws_file() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileIpcAdapter::new(
            "44001",
            FileIpcConfig {
                dir: dir.path().to_path_buf(),
                poll_interval: Duration::from_millis(20),
            },
        );
        adapter.connect().await.unwrap();

        let cmd = CopyCommand {
            leader_ticket: 7,
            symbol: "GBPJPY".to_string(),
            action: TradeAction::Buy,
            kind: TradeEventKind::Open,
            volume: dec!(0.3),
            price: dec!(187.501),
            magic: None,
            comment: CopyCommand::comment_tag(7),
        };

        // No terminal is answering, so the round-trip runs into the caller's
        // deadline. The command file must not survive the abandoned attempt,
        // or the terminal would execute it later.
        let result =
            tokio::time::timeout(Duration::from_millis(250), adapter.send_command(&cmd)).await;
        assert!(result.is_err());

        let mut entries = fs::read_dir(dir.path()).await.unwrap();
        let mut names = vec![];
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![EVENTS_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_rotated_events_file_tailed_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileIpcConfig {
            dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(20),
        };
        let events = dir.path().join(EVENTS_FILE);
        let preexisting = format!(
            "{}{}",
            encode_frame(&wire_event(1)).unwrap(),
            encode_frame(&wire_event(2)).unwrap()
        );
        fs::write(&events, preexisting).await.unwrap();

        let adapter = FileIpcAdapter::new("44001", config);
        adapter.connect().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        adapter.subscribe(tx);

        let loop_adapter = adapter.clone();
        let handle = tokio::spawn(async move { loop_adapter.run_event_loop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Terminal rotates the file: shorter than the tail offset, new content
        fs::write(&events, encode_frame(&wire_event(9)).unwrap())
            .await
            .unwrap();

        let replayed = rx.recv().await.unwrap();
        assert_eq!(replayed.leader_ticket, 9);

        adapter.disconnect().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_files_swept_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cmd_old.json"), b"{}").await.unwrap();
        fs::write(dir.path().join("rsp_old.json"), b"{}").await.unwrap();

        let adapter = FileIpcAdapter::new("44001", FileIpcConfig::new(dir.path()));
        adapter.connect().await.unwrap();

        assert!(fs::metadata(dir.path().join("cmd_old.json")).await.is_err());
        assert!(fs::metadata(dir.path().join("rsp_old.json")).await.is_err());
    }
}

//! Filesystem mailbox transport
//!
//! Cross-process delivery without a network: participants poll a shared
//! directory tree.
//!
//! Directory structure:
//! ```text
//! <base_path>/
//!   outbox/
//!     <envelope-id>_<unix-time>.json   # written by send()
//!   inbox/
//!     <envelope-id>_<unix-time>.json   # consumed by the listener
//! ```
//!
//! Outgoing files are written under a dot-prefixed temporary name and renamed into
//! place, so a poller never sees a partial file. Inbox files are deleted only after
//! dispatch completes: a crash mid-dispatch leaves the file to be processed again.
//! A file that fails to parse stays in place and is retried on later polls, since a
//! peer may still be writing it. Once it has been unreadable for longer than the
//! quarantine grace period it is renamed to `*.json.invalid` and skipped from then on.

use super::dispatch::CommandDispatcher;
use super::envelope::Envelope;
use super::transport::{
    stopped, ListenerTask, Result, StatusCell, Transport, TransportError, TransportStatus,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Protocol name reported by this transport
pub const FILE_PROTOCOL: &str = "mcp_file";

/// Default inbox poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default base directory
pub const DEFAULT_BASE_PATH: &str = "data/mcp_fallback_comm";

/// Default age after which an unparsable inbox file is set aside
pub const DEFAULT_QUARANTINE_AFTER: Duration = Duration::from_secs(60);

/// Filesystem mailbox transport
pub struct FilesystemTransport {
    base_path: PathBuf,
    inbox: PathBuf,
    outbox: PathBuf,
    poll_interval: Duration,
    quarantine_after: Duration,
    dispatcher: Arc<CommandDispatcher>,
    status: StatusCell,
    listener: Mutex<Option<ListenerTask>>,
}

impl FilesystemTransport {
    /// Create a transport rooted at `base_path`
    ///
    /// Directories are created by `initialize`, not here.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            inbox: base_path.join("inbox"),
            outbox: base_path.join("outbox"),
            base_path,
            poll_interval: DEFAULT_POLL_INTERVAL,
            quarantine_after: DEFAULT_QUARANTINE_AFTER,
            dispatcher: Arc::new(CommandDispatcher::new(FILE_PROTOCOL)),
            status: StatusCell::new(),
            listener: Mutex::new(None),
        }
    }

    /// Set the inbox poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set how long an inbox file may stay unparsable before it is set aside
    pub fn with_quarantine_after(mut self, grace: Duration) -> Self {
        self.quarantine_after = grace;
        self
    }

    /// Replace the dispatcher (e.g. a custom handler timeout)
    pub fn with_dispatcher(mut self, dispatcher: CommandDispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    /// Base directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory polled for incoming envelopes
    pub fn inbox_path(&self) -> &Path {
        &self.inbox
    }

    /// Directory outgoing envelopes are written to
    pub fn outbox_path(&self) -> &Path {
        &self.outbox
    }

    /// Process every envelope currently in the inbox
    ///
    /// Returns the number of files dispatched. Normally driven by the listener;
    /// exposed for one-shot consumers.
    pub async fn poll_inbox(&self) -> usize {
        poll_inbox_once(&self.inbox, &self.dispatcher, self.quarantine_after, None).await
    }

    async fn write_envelope(&self, envelope: &Envelope) -> Result<PathBuf> {
        if !fs::try_exists(&self.outbox).await.unwrap_or(false) {
            return Err(TransportError::Unavailable(format!(
                "outbox missing: {}",
                self.outbox.display()
            )));
        }

        let json = envelope.to_json()?;
        let unix_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let filename = format!("{}_{}.json", envelope.id, unix_time);
        let final_path = self.outbox.join(&filename);
        let temp_path = self.outbox.join(format!(".{}.tmp", filename));

        fs::write(&temp_path, json.as_bytes()).await?;
        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(final_path)
    }
}

/// List inbox `*.json` files, oldest first
async fn list_inbox(inbox: &Path) -> Vec<PathBuf> {
    let inbox = inbox.to_path_buf();
    let listed = tokio::task::spawn_blocking(move || list_inbox_blocking(&inbox)).await;
    match listed {
        Ok(files) => files,
        Err(e) => {
            error!(transport = FILE_PROTOCOL, error = %e, "Inbox listing task failed");
            Vec::new()
        }
    }
}

fn list_inbox_blocking(inbox: &Path) -> Vec<PathBuf> {
    // Escape the directory so `[`, `*` or `?` in a configured path match literally
    let escaped = glob::Pattern::escape(&inbox.to_string_lossy());
    let pattern = Path::new(&escaped).join("*.json");
    let pattern = pattern.to_string_lossy();
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            error!(transport = FILE_PROTOCOL, error = %e, "Invalid inbox pattern");
            return Vec::new();
        }
    };

    let mut files: Vec<(SystemTime, PathBuf)> = paths
        .filter_map(|entry| entry.ok())
        .map(|path| {
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();
    files.sort();
    files.into_iter().map(|(_, path)| path).collect()
}

/// How long ago the file was last written
async fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

async fn read_envelope(path: &Path) -> Result<Envelope> {
    let data = fs::read_to_string(path).await?;
    Ok(Envelope::from_json(&data)?)
}

/// One pass over the inbox. Stops early (leaving files in place) if `stop_rx` flips.
async fn poll_inbox_once(
    inbox: &Path,
    dispatcher: &CommandDispatcher,
    quarantine_after: Duration,
    stop_rx: Option<&tokio::sync::watch::Receiver<bool>>,
) -> usize {
    let mut processed = 0;

    for path in list_inbox(inbox).await {
        if stop_rx.is_some_and(|rx| *rx.borrow()) {
            break;
        }

        let envelope = match read_envelope(&path).await {
            Ok(envelope) => envelope,
            // Removed by a concurrent consumer
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                // Possibly still being written by a peer: leave it for the next poll
                let settled = file_age(&path)
                    .await
                    .is_some_and(|age| age >= quarantine_after);
                if !settled {
                    debug!(
                        transport = FILE_PROTOCOL,
                        path = %path.display(),
                        error = %e,
                        "Command file not readable yet; will retry"
                    );
                    continue;
                }

                dispatcher.record_error(e.kind());
                error!(
                    transport = FILE_PROTOCOL,
                    path = %path.display(),
                    error = %e,
                    "Failed to read command file"
                );
                quarantine(&path).await;
                continue;
            }
        };

        dispatcher.dispatch(&envelope).await;
        processed += 1;

        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                dispatcher.record_error("io");
                warn!(
                    transport = FILE_PROTOCOL,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove processed command file"
                );
            }
        }
    }

    processed
}

async fn quarantine(path: &Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(".invalid");
    if let Err(e) = fs::rename(path, &target).await {
        warn!(
            transport = FILE_PROTOCOL,
            path = %path.display(),
            error = %e,
            "Failed to set aside unreadable command file"
        );
    }
}

#[async_trait]
impl Transport for FilesystemTransport {
    fn name(&self) -> &str {
        FILE_PROTOCOL
    }

    async fn initialize(&self) -> bool {
        let created = async {
            fs::create_dir_all(&self.inbox).await?;
            fs::create_dir_all(&self.outbox).await
        }
        .await;

        match created {
            Ok(()) => {
                self.status.set(TransportStatus::Active);
                info!(
                    transport = FILE_PROTOCOL,
                    base_path = %self.base_path.display(),
                    "Transport initialized"
                );
                true
            }
            Err(e) => {
                self.status.set(TransportStatus::Failed);
                error!(
                    transport = FILE_PROTOCOL,
                    base_path = %self.base_path.display(),
                    error = %e,
                    "Transport initialization failed"
                );
                false
            }
        }
    }

    async fn send(&self, envelope: &Envelope) -> bool {
        match self.write_envelope(envelope).await {
            Ok(path) => {
                self.dispatcher.record_sent();
                debug!(
                    transport = FILE_PROTOCOL,
                    message_id = %envelope.id,
                    path = %path.display(),
                    "Command written"
                );
                true
            }
            Err(e) => {
                self.dispatcher.record_error(e.kind());
                error!(
                    transport = FILE_PROTOCOL,
                    message_id = %envelope.id,
                    error = %e,
                    "Failed to write command file"
                );
                false
            }
        }
    }

    async fn start_listening(&self) {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let inbox = self.inbox.clone();
        let dispatcher = self.dispatcher.clone();
        let poll_interval = self.poll_interval;
        let quarantine_after = self.quarantine_after;
        *listener = Some(ListenerTask::spawn(move |mut stop_rx| async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                poll_inbox_once(&inbox, &dispatcher, quarantine_after, Some(&stop_rx)).await;
                tokio::select! {
                    _ = stopped(&mut stop_rx) => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }));
        info!(
            transport = FILE_PROTOCOL,
            inbox = %self.inbox.display(),
            "Started listening"
        );
    }

    async fn stop_listening(&self) {
        let task = self.listener.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
            info!(transport = FILE_PROTOCOL, "Stopped listening");
        }
    }

    async fn health_check(&self) -> bool {
        self.status.get() == TransportStatus::Active
            && fs::try_exists(&self.inbox).await.unwrap_or(false)
            && fs::try_exists(&self.outbox).await.unwrap_or(false)
    }

    fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    fn status(&self) -> TransportStatus {
        self.status.get()
    }

    fn set_status(&self, status: TransportStatus) {
        self.status.set(status);
    }
}

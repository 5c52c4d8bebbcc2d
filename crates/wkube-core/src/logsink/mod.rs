//! Remote log sink and fan-out writer.
//!
//! Everything the job prints, user command output and agent diagnostics alike,
//! goes through [`MultiWriter`], which fans out to stdout, a local logfile,
//! and the remote sink. The sink is deliberately lossy: producers submit into
//! a bounded queue and never block; overflow increments a drop counter that
//! the next batch reports with an omission marker.
//!
//! A background flusher drains the queue every ten seconds and ships the
//! batch to the gateway. When there is nothing to ship it probes the
//! gateway's liveness endpoint instead, and an `is_healthy: false` verdict
//! from either path engages the kill handle, which is the control plane's
//! only way to abort a running job remotely.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;

use crate::gateway::GatewayClient;

/// Bounded queue capacity; writes beyond it are counted and dropped.
const QUEUE_CAPACITY: usize = 1000;

/// Cadence of the background flusher.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct SinkShared {
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Mutex<u64>,
    counter: Mutex<u64>,
    state: AtomicU8,
}

/// Bounded, lossy, batched forwarder of log bytes to the gateway.
#[derive(Clone)]
pub struct RemoteLogSink {
    shared: Arc<SinkShared>,
    flusher: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    shutdown: CancellationToken,
}

impl RemoteLogSink {
    /// Create the sink and spawn its background flusher.
    ///
    /// `kill` is engaged when the gateway reports the job unhealthy; the
    /// controller observes it and runs emergency finalization.
    #[must_use]
    pub fn spawn(gateway: Arc<GatewayClient>, kill: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let shared = Arc::new(SinkShared {
            tx,
            dropped: Mutex::new(0),
            counter: Mutex::new(0),
            state: AtomicU8::new(STATE_RUNNING),
        });

        let shutdown = CancellationToken::new();
        let flusher = tokio::spawn(run_flusher(
            Arc::clone(&shared),
            rx,
            gateway,
            kill,
            shutdown.clone(),
        ));

        Self {
            shared,
            flusher: Arc::new(Mutex::new(Some(flusher))),
            shutdown,
        }
    }

    /// Submit a record. Never blocks; on a full queue the record is dropped
    /// and counted, and the submission still reports success.
    pub fn submit(&self, record: &[u8]) {
        if self.shared.state.load(Ordering::Relaxed) == STATE_CLOSED {
            return;
        }

        match self.shared.tx.try_send(record.to_vec()) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                let mut dropped = self.shared.dropped.lock().expect("dropped counter poisoned");
                *dropped += 1;
            },
            // Flusher gone; the sink is effectively closed.
            Err(TrySendError::Closed(_)) => {},
        }
    }

    /// Drain and ship whatever is queued, then close the sink. Writes racing
    /// with the final flush are best-effort; later writes are discarded.
    pub async fn final_flush(&self) {
        self.shared
            .state
            .store(STATE_DRAINING, Ordering::Relaxed);
        self.shutdown.cancel();

        let handle = self
            .flusher
            .lock()
            .expect("flusher handle poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("log sink flusher ended abnormally: {err}");
            }
        }

        self.shared.state.store(STATE_CLOSED, Ordering::Relaxed);
    }
}

async fn run_flusher(
    shared: Arc<SinkShared>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    gateway: Arc<GatewayClient>,
    kill: CancellationToken,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + FLUSH_INTERVAL;
    let mut tick = tokio::time::interval_at(start, FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                flush_once(&shared, &mut rx, &gateway, &kill).await;
            },
            () = shutdown.cancelled() => {
                flush_once(&shared, &mut rx, &gateway, &kill).await;
                return;
            },
        }
    }
}

async fn flush_once(
    shared: &SinkShared,
    rx: &mut mpsc::Receiver<Vec<u8>>,
    gateway: &GatewayClient,
    kill: &CancellationToken,
) {
    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }

    let dropped = {
        let mut dropped = shared.dropped.lock().expect("dropped counter poisoned");
        std::mem::take(&mut *dropped)
    };

    let Some(batch) = assemble_batch(&records, dropped) else {
        match gateway.check_health().await {
            Ok(true) => {},
            Ok(false) => kill.cancel(),
            Err(err) => warn!("error in health check: {err}"),
        }
        return;
    };

    let log_filename = {
        let mut counter = shared.counter.lock().expect("log counter poisoned");
        let name = format!("wkube{}", *counter);
        *counter += 1;
        name
    };

    match gateway.send_log_batch(&batch, &log_filename).await {
        Ok(true) => {},
        Ok(false) => kill.cancel(),
        Err(err) => warn!("Failed to send logs to remote sink: {err}"),
    }
}

/// Join records into one buffer, prepending the omission marker when writes
/// were dropped. `None` means there is nothing to ship.
fn assemble_batch(records: &[Vec<u8>], dropped: u64) -> Option<Vec<u8>> {
    if records.is_empty() && dropped == 0 {
        return None;
    }

    let mut batch = Vec::with_capacity(records.iter().map(Vec::len).sum::<usize>() + 64);
    if dropped > 0 {
        batch.extend_from_slice(
            format!("\n[Logs omitted: {dropped} messages dropped due to full channel]\n")
                .as_bytes(),
        );
    }
    for record in records {
        batch.extend_from_slice(record);
    }
    Some(batch)
}

/// Fan-out writer: stdout, local logfile, remote sink. No arm's failure
/// reaches the others; the write contract is best-effort and always reports
/// the full length as written.
#[derive(Clone)]
pub struct MultiWriter {
    sink: RemoteLogSink,
    file: Arc<Mutex<std::fs::File>>,
}

impl MultiWriter {
    /// Compose the fan-out writer from the sink and an open logfile.
    #[must_use]
    pub fn new(sink: RemoteLogSink, file: std::fs::File) -> Self {
        Self {
            sink,
            file: Arc::new(Mutex::new(file)),
        }
    }

    /// Write a preformatted line to all three arms.
    pub fn write_bytes(&self, bytes: &[u8]) {
        use std::io::Write as _;

        let _ = io::stdout().write_all(bytes);
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(bytes);
        }
        self.sink.submit(bytes);
    }
}

impl io::Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MultiWriter {
    type Writer = MultiWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Pump an async reader (child stdout/stderr, tunnel output) into the
/// fan-out writer until end of stream.
pub async fn pump<R>(mut reader: R, writer: MultiWriter)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => writer.write_bytes(&buf[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_batch_empty_is_none() {
        assert_eq!(assemble_batch(&[], 0), None);
    }

    #[test]
    fn test_assemble_batch_joins_records() {
        let records = vec![b"one\n".to_vec(), b"two\n".to_vec()];
        let batch = assemble_batch(&records, 0).unwrap();
        assert_eq!(batch, b"one\ntwo\n");
    }

    #[test]
    fn test_assemble_batch_reports_drops_once() {
        let records = vec![b"survivor\n".to_vec()];
        let batch = assemble_batch(&records, 7).unwrap();
        let text = String::from_utf8(batch).unwrap();
        assert!(text.starts_with("\n[Logs omitted: 7 messages dropped due to full channel]\n"));
        assert!(text.ends_with("survivor\n"));
        assert_eq!(text.matches("Logs omitted").count(), 1);
    }

    #[test]
    fn test_assemble_batch_drops_only() {
        // A flush with nothing but drops still ships the marker.
        let batch = assemble_batch(&[], 3).unwrap();
        assert!(String::from_utf8(batch).unwrap().contains("3 messages dropped"));
    }

    #[tokio::test]
    async fn test_pump_forwards_all_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let file = std::fs::File::create(&path).unwrap();

        let gateway = Arc::new(
            GatewayClient::new(&crate::config::AgentConfig {
                gateway_url: "https://localhost:1".to_string(),
                auth_token: "token".to_string(),
                pod_id: "pod".to_string(),
                log_file_name: "job-pod.log".to_string(),
                input_mappings: String::new(),
                output_mappings: String::new(),
                selected_filenames: None,
                selected_foldernames: None,
                interactive_socket: None,
                debug_mapping_path: None,
                tls_no_verify: true,
            })
            .unwrap(),
        );
        let sink = RemoteLogSink::spawn(gateway, CancellationToken::new());
        let writer = MultiWriter::new(sink, file);

        let data: &[u8] = b"hello from the job\n";
        pump(data, writer).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "hello from the job\n");
    }
}

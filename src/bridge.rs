use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::rpc::{self, PerfInfo, ReadEvent, Request, RpcError};

/// Non-response traffic from the child, consumed by the supervisor
/// (recent-errors ring, health surface).
#[derive(Debug)]
pub enum BridgeEvent {
    /// A line from the child's stderr.
    Stderr(String),
    /// A stdout line that did not decode as JSON.
    ParseError { line: String, error: String },
    /// The child's stdout reached EOF; all pending requests were rejected.
    Closed,
}

/// A successful RPC reply: the result payload with `_perf` already
/// stripped off and exposed as a sibling.
#[derive(Debug, Clone)]
pub struct Reply {
    pub result: Value,
    pub perf: Option<PerfInfo>,
}

type Waiter = oneshot::Sender<Result<Reply, RpcError>>;

struct PendingEntry {
    waiters: Vec<Waiter>,
    dedup_key: Option<String>,
    method: String,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingEntry>,
    /// dedup key → pending request id carrying it.
    in_flight: HashMap<String, u64>,
}

impl PendingTable {
    /// Attach the waiter to an in-flight request carrying the same dedup
    /// key, or register a fresh entry. Returns the new id when a request
    /// must actually be written.
    fn register(
        &mut self,
        id: u64,
        method: &str,
        dedup_key: Option<&str>,
        tx: Waiter,
    ) -> Option<u64> {
        if let Some(key) = dedup_key {
            let existing = self.in_flight.get(key).copied();
            if let Some(existing_id) = existing
                && let Some(entry) = self.entries.get_mut(&existing_id)
            {
                tracing::debug!(method, key, id = existing_id, "joined in-flight request");
                entry.waiters.push(tx);
                return None;
            }
        }
        self.entries.insert(
            id,
            PendingEntry {
                waiters: vec![tx],
                dedup_key: dedup_key.map(str::to_owned),
                method: method.to_string(),
            },
        );
        if let Some(key) = dedup_key {
            self.in_flight.insert(key.to_string(), id);
        }
        Some(id)
    }
}

struct Inner {
    table: Mutex<PendingTable>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    events_tx: mpsc::UnboundedSender<BridgeEvent>,
    closed: AtomicBool,
}

/// RPC multiplexer over one child's stdio.
///
/// Correlates requests and responses by id (responses may arrive in any
/// order), enforces per-request deadlines, and joins callers issuing an
/// identical in-flight request onto one pending entry. One `Bridge` maps to
/// one child process incarnation; ids reset when the supervisor restarts the
/// child and builds a fresh bridge.
pub struct Bridge {
    inner: Arc<Inner>,
    next_id: AtomicU64,
}

impl Bridge {
    /// Wire a multiplexer onto a child's stdin/stdout. Spawns the writer and
    /// reader tasks; returns the bridge and the event stream (stderr lines
    /// are added to the same stream via [`Bridge::watch_stderr`]).
    pub fn new<W, R>(stdin: W, stdout: R) -> (Arc<Self>, mpsc::UnboundedReceiver<BridgeEvent>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            table: Mutex::new(PendingTable::default()),
            write_tx,
            events_tx,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(writer_task(stdin, write_rx));
        tokio::spawn(reader_task(stdout, Arc::clone(&inner)));

        (
            Arc::new(Self {
                inner,
                next_id: AtomicU64::new(1),
            }),
            events_rx,
        )
    }

    /// Spawn a task forwarding the child's stderr lines into the event stream.
    pub fn watch_stderr<R>(&self, stderr: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events_tx = self.inner.events_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if events_tx.send(BridgeEvent::Stderr(line)).is_err() {
                    return;
                }
            }
        });
    }

    /// Issue a request and await its response.
    ///
    /// If `dedup_key` matches another pending request, no second envelope is
    /// written; this caller attaches to the existing entry and shares its
    /// completion (and its deadline).
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        dedup_key: Option<&str>,
    ) -> Result<Reply, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport("pike process is not running".into()));
        }

        let (tx, rx) = oneshot::channel();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let issued_id = {
            let mut table = self.inner.table.lock().unwrap_or_else(|e| e.into_inner());
            table.register(id, method, dedup_key, tx)
        };

        if let Some(id) = issued_id {
            let frame = encode_frame(id, method, params)?;
            if self.inner.write_tx.send(frame).is_err() {
                complete(&self.inner, id, Err(RpcError::Transport("stdin closed".into())));
            } else {
                // One timer per issued request is authoritative for the deadline;
                // joined callers share it.
                let inner = Arc::clone(&self.inner);
                let timeout_ms = timeout.as_millis() as u64;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let timed_out = {
                        let table = inner.table.lock().unwrap_or_else(|e| e.into_inner());
                        table.entries.contains_key(&id)
                    };
                    if timed_out {
                        tracing::warn!(id, timeout_ms, "pike request timed out");
                        complete(&inner, id, Err(RpcError::Timeout(timeout_ms)));
                    }
                });
            }
        }

        match rx.await {
            Ok(result) => result,
            // The bridge was torn down without completing us.
            Err(_) => Err(RpcError::Transport("pike process exited".into())),
        }
    }

    /// Reject every pending request and refuse new ones. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        fail_all(&self.inner, reason);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }
}

fn encode_frame(id: u64, method: &str, params: Value) -> Result<Vec<u8>, RpcError> {
    let request = Request::new(id, method, params);
    let mut buf =
        serde_json::to_vec(&request).map_err(|e| RpcError::Protocol(e.to_string()))?;
    buf.push(b'\n');
    Ok(buf)
}

/// Remove a pending entry and fan its outcome out to every attached waiter.
fn complete(inner: &Inner, id: u64, outcome: Result<Reply, RpcError>) {
    let entry = {
        let mut table = inner.table.lock().unwrap_or_else(|e| e.into_inner());
        let entry = table.entries.remove(&id);
        if let Some(entry) = &entry
            && let Some(key) = &entry.dedup_key
            && table.in_flight.get(key) == Some(&id)
        {
            table.in_flight.remove(key);
        }
        entry
    };
    let Some(entry) = entry else { return };
    for waiter in entry.waiters {
        // A waiter that stopped listening (cancelled handler) is fine.
        let _ = waiter.send(outcome.clone());
    }
}

fn fail_all(inner: &Inner, reason: &str) {
    let drained: Vec<(u64, PendingEntry)> = {
        let mut table = inner.table.lock().unwrap_or_else(|e| e.into_inner());
        table.in_flight.clear();
        table.entries.drain().collect()
    };
    for (id, entry) in drained {
        tracing::debug!(id, method = %entry.method, "rejecting pending request: {reason}");
        for waiter in entry.waiters {
            let _ = waiter.send(Err(RpcError::Transport(reason.to_string())));
        }
    }
}

async fn writer_task<W>(mut stdin: W, mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = write_rx.recv().await {
        if stdin.write_all(&frame).await.is_err() || stdin.flush().await.is_err() {
            tracing::debug!("pike stdin closed; writer task exiting");
            return;
        }
    }
}

async fn reader_task<R>(stdout: R, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    loop {
        match rpc::read_frame(&mut reader).await {
            Ok(ReadEvent::Message(response)) => dispatch_response(&inner, response),
            Ok(ReadEvent::ParseError { line, error }) => {
                tracing::warn!(%error, "discarding unparseable line from pike");
                let _ = inner
                    .events_tx
                    .send(BridgeEvent::ParseError { line, error });
            }
            Ok(ReadEvent::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading pike stdout");
                break;
            }
        }
    }
    inner.closed.store(true, Ordering::Release);
    fail_all(&inner, "pike process exited");
    let _ = inner.events_tx.send(BridgeEvent::Closed);
}

fn dispatch_response(inner: &Inner, response: crate::rpc::Response) {
    let Some(id) = response.id else {
        tracing::warn!("response without id from pike; dropping");
        return;
    };

    let known = {
        let table = inner.table.lock().unwrap_or_else(|e| e.into_inner());
        table.entries.contains_key(&id)
    };
    if !known {
        // Timed out earlier, or the child invented an id.
        tracing::debug!(id, "dropping response for unknown or expired id");
        return;
    }

    let outcome = match (response.result, response.error) {
        (Some(mut result), None) => {
            let perf = rpc::extract_perf(&mut result);
            Ok(Reply { result, perf })
        }
        (None, Some(err)) => Err(RpcError::Remote {
            code: err.code,
            message: err.message,
        }),
        _ => Err(RpcError::Protocol(
            "response carries neither result nor error".into(),
        )),
    };
    complete(inner, id, outcome);
}

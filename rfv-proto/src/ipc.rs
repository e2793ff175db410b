//! Messaging channel over a shared SQLite store.
//!
//! Senders append envelopes; every participant polls for undelivered
//! envelopes addressed to it, hands each to a processor and flips the
//! `delivered` flag. Delivery is at-least-once: a crash between processing
//! and marking re-delivers the envelope on the next poll.
//!
//! # Example
//!
//! ```ignore
//! let ipc = Arc::new(IpcService::open(SERVER_ID, &config).await?);
//! let listener = ipc.listen::<ClientMessage, _>(CLIENT_SERVER_CHANNEL, server.clone());
//! ipc.send(CLIENT_SERVER_CHANNEL, "42", &ClientMessage::VmConfig { n_ports: 2 }).await?;
//! listener.shutdown().await;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::IpcConfig;
use crate::error::Result;
use crate::messages::Message;

const MAX_POLL_BACKOFF: Duration = Duration::from_secs(2);

/// Opens (creating if needed) the shared store at `path`.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// A stored message. Only `delivered` changes after insertion.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub seq: i64,
    pub channel: String,
    pub from: String,
    pub to: String,
    pub msg_type: u32,
    pub payload: Vec<u8>,
    pub delivered: bool,
}

impl Envelope {
    pub fn decode<M: Message>(&self) -> Result<M> {
        M::decode(self.msg_type, &self.payload)
    }
}

/// Envelope table access.
pub struct EnvelopeStore {
    pool: SqlitePool,
}

impl EnvelopeStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS envelopes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                msg_type INTEGER NOT NULL,
                payload BLOB NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_envelopes_pending ON envelopes(channel, recipient, delivered, seq)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn append(
        &self,
        channel: &str,
        from: &str,
        to: &str,
        msg_type: u32,
        payload: &[u8],
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO envelopes (channel, sender, recipient, msg_type, payload, delivered, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(channel)
        .bind(from)
        .bind(to)
        .bind(i64::from(msg_type))
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Oldest undelivered envelopes for `to` on `channel`.
    pub async fn pending(&self, channel: &str, to: &str, limit: u32) -> Result<Vec<Envelope>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, channel, sender, recipient, msg_type, payload, delivered
            FROM envelopes
            WHERE channel = ? AND recipient = ? AND delivered = 0
            ORDER BY seq
            LIMIT ?
            "#,
        )
        .bind(channel)
        .bind(to)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_envelope).collect())
    }

    /// Every envelope for `to` on `channel`, delivered or not, oldest first.
    pub async fn history(&self, channel: &str, to: &str) -> Result<Vec<Envelope>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, channel, sender, recipient, msg_type, payload, delivered
            FROM envelopes
            WHERE channel = ? AND recipient = ?
            ORDER BY seq
            "#,
        )
        .bind(channel)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_envelope).collect())
    }

    pub async fn mark_delivered(&self, seq: i64) -> Result<()> {
        sqlx::query("UPDATE envelopes SET delivered = 1 WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_envelope(row: &sqlx::sqlite::SqliteRow) -> Envelope {
    let msg_type: i64 = row.get("msg_type");
    Envelope {
        seq: row.get("seq"),
        channel: row.get("channel"),
        from: row.get("sender"),
        to: row.get("recipient"),
        // Out-of-range codes fall outside every family and fail to decode.
        msg_type: u32::try_from(msg_type).unwrap_or(u32::MAX),
        payload: row.get("payload"),
        delivered: row.get("delivered"),
    }
}

/// Receives decoded messages from a listener.
#[async_trait]
pub trait MessageProcessor<M: Message>: Send + Sync {
    /// Handles one message. The envelope is marked delivered whatever the
    /// return value; `false` only signals the message was not acted upon.
    async fn process(&self, from: &str, to: &str, channel: &str, msg: M) -> bool;
}

/// One participant on the shared store.
pub struct IpcService {
    id: String,
    store: Arc<EnvelopeStore>,
    poll_interval: Duration,
    batch_size: u32,
}

impl IpcService {
    pub async fn open(id: impl Into<String>, config: &IpcConfig) -> Result<Self> {
        let pool = open_pool(&config.db_path).await?;
        let store = Arc::new(EnvelopeStore::new(pool).await?);
        Ok(Self::new(id, store, config))
    }

    /// Joins an already opened store, letting several participants share it.
    pub fn new(id: impl Into<String>, store: Arc<EnvelopeStore>, config: &IpcConfig) -> Self {
        Self {
            id: id.into(),
            store,
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<EnvelopeStore> {
        &self.store
    }

    /// Appends a message for `to`. Fails with a transport error when the
    /// store is unreachable; callers decide whether to retry.
    pub async fn send<M: Message>(&self, channel: &str, to: &str, msg: &M) -> Result<()> {
        let payload = msg.encode()?;
        let seq = self
            .store
            .append(channel, &self.id, to, msg.type_code(), &payload)
            .await?;
        debug!(channel, from = %self.id, to, seq, msg = ?msg, "Message sent");
        Ok(())
    }

    /// Starts polling `channel` for messages addressed to this participant.
    ///
    /// Returns immediately; await [`Listener::join`] to block on it.
    pub fn listen<M, P>(self: &Arc<Self>, channel: &str, processor: Arc<P>) -> Listener
    where
        M: Message,
        P: MessageProcessor<M> + ?Sized + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let ipc = Arc::clone(self);
        let channel_name = channel.to_string();

        let handle = tokio::spawn(async move {
            info!(channel = %channel_name, id = %ipc.id, "Listening");
            let mut backoff = ipc.poll_interval;
            loop {
                let delay = match ipc.poll_once::<M, P>(&channel_name, processor.as_ref()).await {
                    Ok(handled) => {
                        backoff = ipc.poll_interval;
                        if handled as u32 >= ipc.batch_size {
                            Duration::ZERO
                        } else {
                            ipc.poll_interval
                        }
                    }
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Poll failed");
                        let delay = backoff;
                        backoff = (backoff * 2).min(MAX_POLL_BACKOFF);
                        delay
                    }
                };

                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!(channel = %channel_name, id = %ipc.id, "Listener stopped");
        });

        Listener {
            channel: channel.to_string(),
            shutdown: shutdown_tx,
            handle,
        }
    }

    /// Handles one batch. Returns how many envelopes were consumed.
    pub async fn poll_once<M, P>(&self, channel: &str, processor: &P) -> Result<usize>
    where
        M: Message,
        P: MessageProcessor<M> + ?Sized,
    {
        let batch = self
            .store
            .pending(channel, &self.id, self.batch_size)
            .await?;

        for envelope in &batch {
            match envelope.decode::<M>() {
                Ok(msg) => {
                    debug!(channel, from = %envelope.from, seq = envelope.seq, msg = ?msg, "Message received");
                    if !processor
                        .process(&envelope.from, &envelope.to, channel, msg)
                        .await
                    {
                        debug!(channel, seq = envelope.seq, "Message not acted upon");
                    }
                }
                Err(e) => {
                    warn!(
                        channel,
                        from = %envelope.from,
                        seq = envelope.seq,
                        msg_type = envelope.msg_type,
                        kind = %e.kind(),
                        error = %e,
                        "Discarding undecodable message"
                    );
                }
            }
            self.store.mark_delivered(envelope.seq).await?;
        }

        Ok(batch.len())
    }
}

/// Handle of a running listener. Dropping it stops the listener too.
pub struct Listener {
    channel: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Listener {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stops polling. A message being processed is finished first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    /// Blocks until the listener ends.
    pub async fn join(self) {
        let Listener {
            shutdown, handle, ..
        } = self;
        let _ = handle.await;
        drop(shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, ProxyMessage};
    use std::sync::Mutex;
    use tempfile::TempDir;

    async fn setup_store() -> (TempDir, Arc<EnvelopeStore>) {
        let tmp = TempDir::new().unwrap();
        let pool = open_pool(&tmp.path().join("rfv.db")).await.unwrap();
        let store = Arc::new(EnvelopeStore::new(pool).await.unwrap());
        (tmp, store)
    }

    fn participant(id: &str, store: &Arc<EnvelopeStore>) -> Arc<IpcService> {
        let config = IpcConfig::new("unused").with_poll_interval(Duration::from_millis(5));
        Arc::new(IpcService::new(id, Arc::clone(store), &config))
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String, ClientMessage)>>,
        accept: bool,
    }

    #[async_trait]
    impl MessageProcessor<ClientMessage> for Recorder {
        async fn process(&self, from: &str, to: &str, _channel: &str, msg: ClientMessage) -> bool {
            self.seen
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string(), msg));
            self.accept
        }
    }

    #[tokio::test]
    async fn test_send_then_poll() {
        let (_tmp, store) = setup_store().await;
        let vm = participant("42", &store);
        let server = participant("rfserver", &store);

        vm.send("chan", "rfserver", &ClientMessage::VmRegisterRequest { vm_id: 42 })
            .await
            .unwrap();
        vm.send("chan", "rfserver", &ClientMessage::VmConfig { n_ports: 2 })
            .await
            .unwrap();

        let recorder = Recorder::default();
        let handled = server.poll_once("chan", &recorder).await.unwrap();
        assert_eq!(handled, 2);

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "42");
        assert_eq!(seen[0].1, "rfserver");
        assert_eq!(seen[0].2, ClientMessage::VmRegisterRequest { vm_id: 42 });
        assert_eq!(seen[1].2, ClientMessage::VmConfig { n_ports: 2 });

        // Rejected by the processor, still marked delivered.
        let history = store.history("chan", "rfserver").await.unwrap();
        assert!(history.iter().all(|e| e.delivered));
        assert_eq!(server.poll_once("chan", &recorder).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_addressing() {
        let (_tmp, store) = setup_store().await;
        let a = participant("a", &store);
        let b = participant("b", &store);

        a.send("one", "b", &ClientMessage::VmConfig { n_ports: 1 })
            .await
            .unwrap();
        a.send("two", "b", &ClientMessage::VmConfig { n_ports: 2 })
            .await
            .unwrap();

        let recorder = Recorder::default();
        // Not addressed to a.
        assert_eq!(a.poll_once("one", &recorder).await.unwrap(), 0);
        // Only the envelope on channel "two".
        assert_eq!(b.poll_once("two", &recorder).await.unwrap(), 1);
        assert_eq!(
            recorder.seen.lock().unwrap()[0].2,
            ClientMessage::VmConfig { n_ports: 2 }
        );
        assert_eq!(store.pending("one", "b", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_consumed() {
        let (_tmp, store) = setup_store().await;
        let server = participant("rfserver", &store);
        let proxy = participant("rfproxy", &store);

        // A proxy-family message on a channel read as the client family.
        proxy
            .send("chan", "rfserver", &ProxyMessage::DatapathLeave { dp_id: 1 })
            .await
            .unwrap();
        store
            .append("chan", "rfproxy", "rfserver", 2, &[0xff])
            .await
            .unwrap();

        let recorder = Recorder::default();
        assert_eq!(server.poll_once("chan", &recorder).await.unwrap(), 2);
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(store.pending("chan", "rfserver", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_limit() {
        let (_tmp, store) = setup_store().await;
        let config = IpcConfig {
            db_path: "unused".into(),
            poll_interval: Duration::from_millis(5),
            batch_size: 2,
        };
        let server = IpcService::new("rfserver", Arc::clone(&store), &config);
        for n in 0..5 {
            server
                .send("chan", "rfserver", &ClientMessage::VmConfig { n_ports: n })
                .await
                .unwrap();
        }

        let recorder = Recorder::default();
        assert_eq!(server.poll_once("chan", &recorder).await.unwrap(), 2);
        assert_eq!(server.poll_once("chan", &recorder).await.unwrap(), 2);
        assert_eq!(server.poll_once("chan", &recorder).await.unwrap(), 1);
        let ports: Vec<_> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, m)| m.clone())
            .collect();
        assert_eq!(ports[4], ClientMessage::VmConfig { n_ports: 4 });
    }

    #[tokio::test]
    async fn test_listener_delivers_and_stops() {
        let (_tmp, store) = setup_store().await;
        let vm = participant("42", &store);
        let server = participant("rfserver", &store);

        let recorder = Arc::new(Recorder {
            accept: true,
            ..Default::default()
        });
        let listener = server.listen::<ClientMessage, _>("chan", Arc::clone(&recorder));
        assert_eq!(listener.channel(), "chan");

        vm.send("chan", "rfserver", &ClientMessage::VmRegisterRequest { vm_id: 42 })
            .await
            .unwrap();

        for _ in 0..200 {
            if !recorder.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);

        tokio::time::timeout(Duration::from_secs(2), listener.shutdown())
            .await
            .expect("listener did not stop");
    }
}

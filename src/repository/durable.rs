use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{error, info};

use crate::model::*;
use crate::wal::Wal;

use super::{StorageError, UserRepository, UserTable};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Every append that is already queued when the first one arrives joins the
/// same batch and shares one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

/// Write and fsync one batch. All or nothing: if any frame fails to reach
/// disk the log is rolled back to where the batch started and every caller
/// in it gets the error.
fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let checkpoint = wal.checkpoint();
    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback(checkpoint)
    {
        error!("WAL rollback failed, refusing further appends: {e}");
        result = Err(e);
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Repository whose every mutation is logged to a WAL before it becomes
/// visible. State is rebuilt from the log on open.
pub struct DurableUserRepository {
    table: UserTable,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes creations so the existence check and the log append agree.
    create_lock: Mutex<()>,
    /// Mutations hold it shared; compaction holds it exclusively so no append
    /// can land in the old log after the snapshot was taken.
    compaction_gate: RwLock<()>,
}

impl DurableUserRepository {
    /// Replay `wal_path` and start the writer task. Must run inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let table = UserTable::from_events(&events);
        info!(
            "replayed {} events into {} users from {}",
            events.len(),
            table.len(),
            wal_path.display()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            table,
            wal_tx,
            create_lock: Mutex::new(()),
            compaction_gate: RwLock::new(()),
        })
    }

    pub fn with_user_limit(mut self, max_users: usize) -> Self {
        self.table.set_max_users(max_users);
        self
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StorageError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as one snapshot event per user. Mutations wait until
    /// the compacted file has replaced the old one.
    pub async fn compact_wal(&self) -> Result<(), StorageError> {
        let _exclusive = self.compaction_gate.write().await;
        let events = self.table.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StorageError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StorageError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StorageError::Wal(e.to_string()))
    }
}

#[async_trait]
impl UserRepository for DurableUserRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        Ok(self.table.read(email).await)
    }

    async fn find_projection(
        &self,
        email: &str,
        fields: &[Field],
    ) -> Result<Option<UserProjection>, StorageError> {
        let Some(shared) = self.table.get(email) else {
            return Ok(None);
        };
        let guard = shared.read().await;
        Ok(Some(guard.project(fields)))
    }

    async fn create(&self, user: User) -> Result<User, StorageError> {
        let _creating = self.create_lock.lock().await;
        let _shared = self.compaction_gate.read().await;
        if self.table.contains(&user.email) {
            return Err(StorageError::DuplicateKey(user.email));
        }
        if !self.table.has_room() {
            return Err(StorageError::CapacityExceeded);
        }
        self.wal_append(&Event::UserCreated { user: user.clone() })
            .await?;
        self.table.insert_new(user.clone())?;
        Ok(user)
    }

    async fn update(&self, email: &str, patch: UserPatch) -> Result<User, StorageError> {
        let shared = self
            .table
            .get(email)
            .ok_or_else(|| StorageError::MissingRecord(email.to_string()))?;
        let _shared = self.compaction_gate.read().await;
        let mut guard = shared.write().await;
        let event = Event::UserPatched {
            email: email.to_string(),
            patch: patch.clone(),
        };
        self.wal_append(&event).await?;
        guard.apply(&patch);
        Ok(guard.clone())
    }

    fn user_count(&self) -> usize {
        self.table.len()
    }
}

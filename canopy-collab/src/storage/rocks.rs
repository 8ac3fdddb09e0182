//! RocksDB-backed collaboration store.
//!
//! Column families:
//! - `sessions`      — Session rows, keyed by session_id
//! - `participants`  — Participant rows, keyed by session_id ‖ user_id
//! - `user_sessions` — Membership index, keyed by user_id ‖ session_id (empty value)
//! - `operations`    — Sealed operation records, keyed by session_id ‖ sequence (BE)
//! - `presence`      — Presence rows, keyed by session_id ‖ user_id
//! - `sequences`     — Last appended sequence per session (u64 BE)
//!
//! Multi-row writes go through a single `WriteBatch`, so a session and its
//! owner row, or an operation and its sequence bump, land atomically.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, ReadOptions, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::codec::{self, open_operation, seal_operation};
use super::{CollabStore, StoreError};
use crate::model::{Operation, Participant, PresenceRecord, Session, SessionId, UserId};

const CF_SESSIONS: &str = "sessions";
const CF_PARTICIPANTS: &str = "participants";
const CF_USER_SESSIONS: &str = "user_sessions";
const CF_OPERATIONS: &str = "operations";
const CF_PRESENCE: &str = "presence";
const CF_SEQUENCES: &str = "sequences";

const COLUMN_FAMILIES: &[&str] = &[
    CF_SESSIONS,
    CF_PARTICIPANTS,
    CF_USER_SESSIONS,
    CF_OPERATIONS,
    CF_PRESENCE,
    CF_SEQUENCES,
];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("canopy_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB implementation of [`CollabStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded CF mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating column families
    /// that don't exist yet.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened collaboration store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PARTICIPANTS | CF_USER_SESSIONS | CF_OPERATIONS | CF_PRESENCE => {
                // Scanned by the leading 16-byte id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }
        if name == CF_OPERATIONS {
            // Records are already LZ4 sealed
            opts.set_compression_type(DBCompressionType::None);
        }

        opts
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::DatabaseError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Collect all values whose key starts with `prefix` (16 bytes).
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn pair_key(first: Uuid, second: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(first.as_bytes());
        key.extend_from_slice(second.as_bytes());
        key
    }

    /// session_id (16 bytes) + sequence (8 bytes big-endian)
    fn operation_key(session_id: SessionId, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(session_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
        let buf: [u8; 8] = bytes
            .try_into()
            .map_err(|_| StoreError::DeserializationError("invalid sequence value".into()))?;
        Ok(u64::from_be_bytes(buf))
    }

    fn put_participant_rows(&self, batch: &mut WriteBatch, participant: &Participant) -> Result<(), StoreError> {
        let cf_participants = self.cf(CF_PARTICIPANTS)?;
        let cf_index = self.cf(CF_USER_SESSIONS)?;
        batch.put_cf(
            cf_participants,
            Self::pair_key(participant.session_id, participant.user_id),
            codec::encode(participant)?,
        );
        batch.put_cf(
            cf_index,
            Self::pair_key(participant.user_id, participant.session_id),
            [],
        );
        Ok(())
    }
}

impl CollabStore for RocksStore {
    fn insert_session(&self, session: &Session, owner: &Participant) -> Result<(), StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        if self.db.get_cf(cf_sessions, session.id.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(format!("session {}", session.id)));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_sessions, session.id.as_bytes(), codec::encode(session)?);
        self.put_participant_rows(&mut batch, owner)?;
        self.write(batch)
    }

    fn load_session(&self, session_id: SessionId) -> Result<Option<Session>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_SESSIONS)?, session.id.as_bytes(), codec::encode(session)?);
        self.write(batch)
    }

    fn put_participants(&self, participants: &[Participant]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for participant in participants {
            self.put_participant_rows(&mut batch, participant)?;
        }
        self.write(batch)
    }

    fn load_participant(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<Option<Participant>, StoreError> {
        let cf = self.cf(CF_PARTICIPANTS)?;
        match self.db.get_cf(cf, Self::pair_key(session_id, user_id))? {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_participants(&self, session_id: SessionId) -> Result<Vec<Participant>, StoreError> {
        self.scan_prefix(CF_PARTICIPANTS, session_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| codec::decode(&value))
            .collect()
    }

    fn sessions_for_user(&self, user_id: UserId) -> Result<Vec<SessionId>, StoreError> {
        self.scan_prefix(CF_USER_SESSIONS, user_id.as_bytes())?
            .into_iter()
            .map(|(key, _)| {
                let bytes: [u8; 16] = key[16..]
                    .try_into()
                    .map_err(|_| StoreError::DeserializationError("invalid membership key".into()))?;
                Ok(Uuid::from_bytes(bytes))
            })
            .collect()
    }

    fn append_operation(&self, op: &Operation) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_seq = self.cf(CF_SEQUENCES)?;

        let expected = self.last_sequence(op.session_id)? + 1;
        if op.sequence != expected {
            return Err(StoreError::SequenceConflict {
                expected,
                got: op.sequence,
            });
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, Self::operation_key(op.session_id, op.sequence), seal_operation(op)?);
        batch.put_cf(cf_seq, op.session_id.as_bytes(), op.sequence.to_be_bytes());
        self.write(batch)
    }

    fn operations_after(
        &self,
        session_id: SessionId,
        after: u64,
        limit: usize,
    ) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start_key = Self::operation_key(session_id, start);

        let mut ops = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            if ops.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != session_id.as_bytes() {
                break;
            }
            ops.push(open_operation(&value)?);
        }
        Ok(ops)
    }

    fn last_sequence(&self, session_id: SessionId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_SEQUENCES)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => Self::decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn mark_applied(&self, session_id: SessionId, sequence: u64) -> Result<bool, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let key = Self::operation_key(session_id, sequence);
        let Some(bytes) = self.db.get_cf(cf, &key)? else {
            return Ok(false);
        };
        let mut op = open_operation(&bytes)?;
        if !op.applied {
            op.applied = true;
            let mut batch = WriteBatch::default();
            batch.put_cf(cf, &key, seal_operation(&op)?);
            self.write(batch)?;
        }
        Ok(true)
    }

    fn put_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        let mut write_opts = WriteOptions::default();
        // Presence is rebuilt from heartbeats; never fsync it
        write_opts.set_sync(false);
        self.db.put_cf_opt(
            cf,
            Self::pair_key(record.session_id, record.user_id),
            codec::encode(record)?,
            &write_opts,
        )?;
        Ok(())
    }

    fn list_presence(&self, session_id: SessionId) -> Result<Vec<PresenceRecord>, StoreError> {
        self.scan_prefix(CF_PRESENCE, session_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| codec::decode(&value))
            .collect()
    }

    fn presence_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        // Crosses prefixes, so bypass the prefix extractor
        let mut read_opts = ReadOptions::default();
        read_opts.set_total_order_seek(true);

        let mut sessions: Vec<SessionId> = Vec::new();
        for item in self.db.iterator_cf_opt(cf, read_opts, IteratorMode::Start) {
            let (key, _) = item?;
            let Some(prefix) = key.get(..16) else {
                continue;
            };
            let session_id = Uuid::from_slice(prefix)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            if sessions.last() != Some(&session_id) {
                sessions.push(session_id);
            }
        }
        Ok(sessions)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

//! RocksDB-backed note store.
//!
//! Column families:
//! - `notes`    — `NoteDocument` per note (bincode, LZ4 compressed), key `note_id`
//! - `events`   — edit log entries, key `note_id:16 ‖ sequence:8 BE`
//! - `presence` — presence rows, key `note_id:16 ‖ user_id:16`
//!
//! Big-endian sequence keys keep a note's events contiguous and ordered,
//! so loading history is one forward prefix scan.

use std::path::{Path, PathBuf};

use notes_core::{EditLogEntry, NoteDocument};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, SliceTransform, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use super::{ContentStore, PresenceStore, StoreError};
use crate::presence::PresenceEntry;

const CF_NOTES: &str = "notes";
const CF_EVENTS: &str = "events";
const CF_PRESENCE: &str = "presence";

const COLUMN_FAMILIES: &[&str] = &[CF_NOTES, CF_EVENTS, CF_PRESENCE];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("notes_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
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

/// Durable [`ContentStore`] and [`PresenceStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened note store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_NOTES => {
                // Values are already LZ4 framed by us.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_EVENTS | CF_PRESENCE => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn put_note(&self, note_id: Uuid, document: &NoteDocument) -> Result<(), StoreError> {
        let cf = self.cf(CF_NOTES)?;
        let compressed = lz4_flex::compress_prepend_size(&encode(document)?);
        self.db.put_cf_opt(&cf, note_id.as_bytes(), compressed, &self.write_opts())?;
        Ok(())
    }

    /// Decoded values of every key in `cf` starting with `note_id`.
    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, note_id: Uuid) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = note_id.as_bytes();

        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn event_key(note_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(note_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    fn presence_key(note_id: Uuid, user_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(note_id.as_bytes());
        key.extend_from_slice(user_id.as_bytes());
        key
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ContentStore for RocksStore {
    fn load(&self, note_id: Uuid) -> Result<NoteDocument, StoreError> {
        let cf = self.cf(CF_NOTES)?;
        match self.db.get_cf(&cf, note_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                decode(&bytes)
            }
            None => Err(StoreError::NotFound(note_id)),
        }
    }

    fn save(&self, note_id: Uuid, document: &NoteDocument) -> Result<(), StoreError> {
        self.put_note(note_id, document)
    }

    fn append_event(&self, note_id: Uuid, entry: &EditLogEntry) -> Result<(), StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let key = Self::event_key(note_id, entry.sequence);
        self.db.put_cf_opt(&cf, key, encode(entry)?, &self.write_opts())?;
        Ok(())
    }

    fn load_events(&self, note_id: Uuid) -> Result<Vec<EditLogEntry>, StoreError> {
        self.scan_prefix(CF_EVENTS, note_id)
    }

    fn create(&self, note_id: Uuid, content: &str) -> Result<NoteDocument, StoreError> {
        match self.load(note_id) {
            Ok(existing) => Ok(existing),
            Err(StoreError::NotFound(_)) => {
                let document = NoteDocument::new(content, 0);
                self.put_note(note_id, &document)?;
                Ok(document)
            }
            Err(e) => Err(e),
        }
    }
}

impl PresenceStore for RocksStore {
    fn upsert(&self, entry: &PresenceEntry) -> Result<(), StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        let key = Self::presence_key(entry.note_id, entry.user_id);
        self.db.put_cf_opt(&cf, key, encode(entry)?, &self.write_opts())?;
        Ok(())
    }

    fn delete(&self, note_id: Uuid, user_id: Uuid) -> Result<(), StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        self.db
            .delete_cf_opt(&cf, Self::presence_key(note_id, user_id), &self.write_opts())?;
        Ok(())
    }

    fn list(&self, note_id: Uuid) -> Result<Vec<PresenceEntry>, StoreError> {
        self.scan_prefix(CF_PRESENCE, note_id)
    }

    fn clear(&self, note_id: Uuid) -> Result<usize, StoreError> {
        let cf = self.cf(CF_PRESENCE)?;
        let prefix = note_id.as_bytes();

        let mut batch = WriteBatch::default();
        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }
}

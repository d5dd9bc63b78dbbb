//! Durable backends for the counter store
//!
//! Record format: key = counter name (UTF-8 bytes), value = decimal ASCII
//! of the counter value. No other encoding, no version field.

use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Key/value persistence behind the counter store.
///
/// Writes are independent per counter; there is no multi-key transaction.
/// `sync` and `close` may block on disk and are called without the store's
/// lock held.
pub trait CounterBackend: Send + Sync {
    /// Every persisted `(name, value)` pair
    fn load(&self) -> Result<Vec<(String, u64)>>;

    /// Persist one counter
    fn put(&self, name: &str, value: u64) -> Result<()>;

    /// Make completed writes durable
    fn sync(&self) -> Result<()>;

    /// Release the backend; called once after the final flush
    fn close(&self) -> Result<()>;
}

/// Encode a counter value for storage
pub fn encode_value(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}

/// Decode a stored record
pub fn decode_record(key: &[u8], value: &[u8]) -> Result<(String, u64)> {
    let name = std::str::from_utf8(key)
        .map_err(|e| Error::Decode(format!("counter name is not UTF-8: {}", e)))?;
    let raw = std::str::from_utf8(value)
        .map_err(|e| Error::Decode(format!("value of {} is not ASCII: {}", name, e)))?;
    let value = raw.parse::<u64>().map_err(|e| {
        Error::Decode(format!("value of {} ({:?}) is not a count: {}", name, raw, e))
    })?;
    Ok((name.to_string(), value))
}

// =============================================================================
// Sled
// =============================================================================

/// sled-backed counter persistence
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!("Opened counter database at {}", path.display());
        Ok(Self { db })
    }

    /// Underlying database
    pub fn db(&self) -> &sled::Db {
        &self.db
    }
}

impl CounterBackend for SledBackend {
    fn load(&self) -> Result<Vec<(String, u64)>> {
        let mut records = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let record = decode_record(&key, &value)?;
            debug!("Loaded counter {} = {}", record.0, record.1);
            records.push(record);
        }
        Ok(records)
    }

    fn put(&self, name: &str, value: u64) -> Result<()> {
        self.db.insert(name.as_bytes(), encode_value(value))?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.db.flush()?;
        info!("Closed counter database");
        Ok(())
    }
}

impl std::fmt::Debug for SledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBackend")
            .field("records", &self.db.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_record_format() {
        assert_eq!(encode_value(0), b"0".to_vec());
        assert_eq!(encode_value(1234), b"1234".to_vec());
        assert_eq!(
            decode_record(b"ops", b"42").unwrap(),
            ("ops".to_string(), 42)
        );
    }

    #[test]
    fn test_malformed_records() {
        assert_matches!(decode_record(b"ops", b"-1"), Err(Error::Decode(_)));
        assert_matches!(decode_record(b"ops", b"4x"), Err(Error::Decode(_)));
        assert_matches!(decode_record(&[0xff], b"1"), Err(Error::Decode(_)));
    }

    #[test]
    fn test_sled_put_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SledBackend::open(dir.path()).unwrap();

        backend.put("b", 2).unwrap();
        backend.put("a", 1).unwrap();
        backend.put("a", 3).unwrap();
        backend.sync().unwrap();

        let mut records = backend.load().unwrap();
        records.sort();
        assert_eq!(records, vec![("a".to_string(), 3), ("b".to_string(), 2)]);

        // Raw bytes follow the record format
        assert_eq!(backend.db().get("a").unwrap().unwrap().as_ref(), b"3");
    }

    #[test]
    fn test_load_rejects_foreign_values() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SledBackend::open(dir.path()).unwrap();
        backend.db().insert("ops", "lots").unwrap();

        assert_matches!(backend.load(), Err(Error::Decode(_)));
    }
}

/// File-backed store
pub mod file;
/// In-memory store
pub mod memory;

use core::fmt::Debug;
use core::ops::Deref;

use lnchannel::channel::ChannelId;
use lnchannel::persist::model::ChannelEntry;
use lnchannel::persist::{Error, Persist};
use lnchannel::SendSync;
use log::*;
use serde_json::{from_slice, to_vec};

const CHANNEL_PREFIX: &str = "channel";
const SEPARATOR: &str = "/";

/// key-version-value
pub struct KVV(pub String, pub (u64, Vec<u8>));

impl Debug for KVV {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("KVV").field(&self.0).field(&self.1 .0).field(&self.1 .1.len()).finish()
    }
}

impl KVV {
    /// convert to the inner tuple
    pub fn into_inner(self) -> (String, (u64, Vec<u8>)) {
        (self.0, self.1)
    }
}

/// A key-version-value store.
///
/// Versions of a key only move forward.  Rewriting a key at its current
/// version is allowed only with an identical value.  A deleted key is a
/// tombstone with an empty value, so its version is not reused.
pub trait KVVStore: SendSync {
    /// Iterator returned by a prefix scan
    type Iter: Iterator<Item = KVV>;

    /// Put a value at the next version of the key
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let version = self.get_version(key)?.map(|v| v + 1).unwrap_or(0);
        self.put_with_version(key, version, value)
    }
    /// If the key already exists, the version must be greater than the existing version.
    fn put_with_version(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error>;
    /// Put several KVVs into the store.  Either all versions check out or
    /// nothing is written.
    fn put_batch(&self, kvvs: &[&KVV]) -> Result<(), Error>;
    /// Get a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error>;
    /// Get the version of a key-value pair from the store
    /// Returns Ok(None) if the key does not exist.
    fn get_version(&self, key: &str) -> Result<Option<u64>, Error>;
    /// Get all key-value pairs with the given prefix, in key order
    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error>;
    /// Delete a key-value pair from the store
    fn delete(&self, key: &str) -> Result<(), Error> {
        self.put(key, &[])
    }
    /// Clear the database
    fn clear_database(&self) -> Result<(), Error>;
}

/// Check that `version` may replace `existing` for `key`
pub(crate) fn check_version(
    key: &str,
    version: u64,
    value: &[u8],
    existing: Option<&(u64, Vec<u8>)>,
) -> Result<bool, Error> {
    match existing {
        Some((ver, _)) if version < *ver => {
            error!("version mismatch for {}: {} < {}", key, version, ver);
            Err(Error::VersionMismatch(format!("{}: {} < {}", key, version, ver)))
        }
        Some((ver, val)) if version == *ver => {
            // same version, the value must not have changed
            if val.as_slice() != value {
                error!("value mismatch for {}: {}", key, version);
                return Err(Error::VersionMismatch(format!("{}: value changed at {}", key, ver)));
            }
            Ok(false)
        }
        _ => Ok(true),
    }
}

/// Adapter for a KVVStore to implement Persist.
///
/// Channel entries are stored as JSON under `channel/<hex id>`.
pub struct KVVPersister<S: KVVStore>(pub S);

impl<S: KVVStore> Deref for KVVPersister<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: KVVStore> SendSync for KVVPersister<S> {}

impl<S: KVVStore> KVVPersister<S> {
    // The live value and version of a channel, skipping tombstones
    fn get_live(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        Ok(self.get(key)?.filter(|(_, value)| !value.is_empty()))
    }
}

impl<S: KVVStore> Persist for KVVPersister<S> {
    fn new_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        let key = make_key(CHANNEL_PREFIX, id.as_slice());
        if self.get_live(&key)?.is_some() {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        debug!("new channel {}", id);
        self.put(&key, &encode(entry)?)
    }

    fn update_channel(&self, id: &ChannelId, entry: &ChannelEntry) -> Result<(), Error> {
        let key = make_key(CHANNEL_PREFIX, id.as_slice());
        let (version, _) = self.get_live(&key)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        trace!("update channel {} to version {}", id, version + 1);
        self.put_with_version(&key, version + 1, &encode(entry)?)
    }

    fn get_channel(&self, id: &ChannelId) -> Result<ChannelEntry, Error> {
        let key = make_key(CHANNEL_PREFIX, id.as_slice());
        let (_, value) = self.get_live(&key)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        decode(&key, &value)
    }

    fn get_channels(&self) -> Result<Vec<(ChannelId, ChannelEntry)>, Error> {
        let prefix = CHANNEL_PREFIX.to_string() + SEPARATOR;
        let mut res = Vec::new();
        for kvv in self.get_prefix(&prefix)? {
            let (key, (_version, value)) = kvv.into_inner();
            if value.is_empty() {
                continue; // ignore tombstones
            }
            let suffix = extract_key_suffix(&prefix, &key)?;
            res.push((ChannelId::new(&suffix), decode(&key, &value)?));
        }
        Ok(res)
    }

    fn delete_channel(&self, id: &ChannelId) -> Result<(), Error> {
        let key = make_key(CHANNEL_PREFIX, id.as_slice());
        if self.get_live(&key)?.is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        debug!("delete channel {}", id);
        self.delete(&key)
    }

    fn clear_database(&self) -> Result<(), Error> {
        // delegate to the underlying store
        self.0.clear_database()
    }
}

fn encode(entry: &ChannelEntry) -> Result<Vec<u8>, Error> {
    to_vec(entry).map_err(|e| Error::Internal(format!("encode channel entry: {}", e)))
}

fn decode(key: &str, value: &[u8]) -> Result<ChannelEntry, Error> {
    from_slice(value).map_err(|e| Error::Internal(format!("decode {}: {}", key, e)))
}

fn make_key(prefix: &str, key: &[u8]) -> String {
    format!("{}{}{}", prefix, SEPARATOR, hex::encode(key))
}

fn extract_key_suffix(prefix: &str, key: &str) -> Result<Vec<u8>, Error> {
    let suffix = key
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Internal(format!("key {} outside {}", key, prefix)))?;
    hex::decode(suffix).map_err(|e| Error::Internal(format!("bad key {}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_test() {
        let key = make_key(CHANNEL_PREFIX, &[0xab, 0x01]);
        assert_eq!(key, "channel/ab01");
        assert_eq!(extract_key_suffix("channel/", &key).unwrap(), vec![0xab, 0x01]);
        assert!(matches!(extract_key_suffix("channel/", "node/ab"), Err(Error::Internal(_))));
        assert!(matches!(extract_key_suffix("channel/", "channel/zz"), Err(Error::Internal(_))));
    }

    #[test]
    fn check_version_test() {
        let existing = (3, vec![1, 2]);
        assert!(check_version("k", 4, &[9], Some(&existing)).unwrap());
        assert!(!check_version("k", 3, &[1, 2], Some(&existing)).unwrap());
        assert!(matches!(
            check_version("k", 3, &[9], Some(&existing)),
            Err(Error::VersionMismatch(_))
        ));
        assert!(matches!(
            check_version("k", 2, &[1, 2], Some(&existing)),
            Err(Error::VersionMismatch(_))
        ));
        assert!(check_version("k", 0, &[], None).unwrap());
    }
}

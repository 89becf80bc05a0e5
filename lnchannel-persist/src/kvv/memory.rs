use std::collections::BTreeMap;
use std::sync::Mutex;

use lnchannel::persist::Error;
use lnchannel::SendSync;

use crate::kvv::{check_version, KVVPersister, KVVStore, KVV};

/// A key-version-value in-memory store.
pub struct MemoryKVVStore {
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

/// An iterator over a KVVStore range
pub struct Iter(std::vec::IntoIter<KVV>);

impl Iterator for Iter {
    type Item = KVV;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl Iter {
    pub(crate) fn new(kvvs: Vec<KVV>) -> Self {
        Iter(kvvs.into_iter())
    }
}

impl MemoryKVVStore {
    /// Create a new MemoryKVVStore
    pub fn new() -> KVVPersister<Self> {
        KVVPersister(Self { data: Mutex::new(BTreeMap::new()) })
    }
}

impl SendSync for MemoryKVVStore {}

impl KVVStore for MemoryKVVStore {
    type Iter = Iter;

    fn put_with_version(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        if check_version(key, version, value, data.get(key))? {
            data.insert(key.to_string(), (version, value.to_vec()));
        }
        Ok(())
    }

    fn put_batch(&self, kvvs: &[&KVV]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        for kvv in kvvs {
            let (version, value) = &kvv.1;
            check_version(&kvv.0, *version, value, data.get(&kvv.0))?;
        }
        for kvv in kvvs {
            data.insert(kvv.0.clone(), kvv.1.clone());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>, Error> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).cloned())
    }

    fn get_version(&self, key: &str) -> Result<Option<u64>, Error> {
        let data = self.data.lock().unwrap();
        Ok(data.get(key).map(|(v, _)| *v))
    }

    fn get_prefix(&self, prefix: &str) -> Result<Self::Iter, Error> {
        let data = self.data.lock().unwrap();
        Ok(Iter::new(scan_prefix(&data, prefix)))
    }

    fn clear_database(&self) -> Result<(), Error> {
        self.data.lock().unwrap().clear();
        Ok(())
    }
}

/// Entries of an ordered map whose keys start with `prefix`
pub(crate) fn scan_prefix(data: &BTreeMap<String, (u64, Vec<u8>)>, prefix: &str) -> Vec<KVV> {
    data.range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, (ver, value))| KVV(k.clone(), (*ver, value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn put_get_test() {
        let store = MemoryKVVStore::new();
        assert_eq!(store.get("a/1").unwrap(), None);
        store.put("a/1", &[1]).unwrap();
        store.put("a/1", &[2]).unwrap();
        assert_eq!(store.get("a/1").unwrap(), Some((1, vec![2])));
        assert_eq!(store.get_version("a/1").unwrap(), Some(1));

        assert!(matches!(store.put_with_version("a/1", 0, &[3]), Err(Error::VersionMismatch(_))));
        // an identical rewrite is a no-op
        store.put_with_version("a/1", 1, &[2]).unwrap();
        store.delete("a/1").unwrap();
        assert_eq!(store.get("a/1").unwrap(), Some((2, vec![])));
    }

    #[test]
    fn prefix_test() {
        let store = MemoryKVVStore::new();
        store.put("a/2", &[2]).unwrap();
        store.put("a/1", &[1]).unwrap();
        store.put("b/1", &[3]).unwrap();
        store.put("a", &[4]).unwrap();
        let keys: Vec<_> = store.get_prefix("a/").unwrap().map(|kvv| kvv.0).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[test]
    fn batch_test() {
        let store = MemoryKVVStore::new();
        store.put("a/1", &[1]).unwrap();
        store.put("a/1", &[1, 1]).unwrap();
        let stale = KVV("a/1".to_string(), (0, vec![9]));
        let fresh = KVV("a/2".to_string(), (0, vec![2]));
        assert!(matches!(store.put_batch(&[&fresh, &stale]), Err(Error::VersionMismatch(_))));
        // nothing was written
        assert_eq!(store.get("a/2").unwrap(), None);

        let update = KVV("a/1".to_string(), (2, vec![3]));
        store.put_batch(&[&fresh, &update]).unwrap();
        assert_eq!(store.get("a/1").unwrap(), Some((2, vec![3])));
        assert_eq!(store.get("a/2").unwrap(), Some((0, vec![2])));

        store.clear_database().unwrap();
        assert_eq!(store.get_prefix("").unwrap().count(), 0);
    }
}

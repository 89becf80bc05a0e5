use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lnchannel::persist::Error;
use lnchannel::util::crypto_utils::sha256;
use lnchannel::SendSync;
use tempfile::NamedTempFile;
use tracing::*;

use crate::kvv::memory::{scan_prefix, Iter};
use crate::kvv::{check_version, KVVPersister, KVVStore, KVV};

const VERSION_LEN: usize = 8;
const KEY_LEN_LEN: usize = 4;
const HEADER_LEN: usize = VERSION_LEN + KEY_LEN_LEN;

/// A key-version-value store with one file per key in a directory.
///
/// A file is named by the hex SHA256 of its key, so names have a fixed
/// length whatever the key.  It holds the big-endian version, the
/// big-endian key length, the key and the value.  A write goes to a
/// temporary file in the same directory, is synced, renamed over the old
/// file, and the directory is synced, so a crash leaves either the old or
/// the new value.  A batch is checked as a whole before any file is
/// written, but is only atomic per key on disk.
///
/// All keys are cached in memory and read at open.
pub struct FileKVVStore {
    dir: PathBuf,
    data: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
}

impl FileKVVStore {
    /// Open the store in `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<KVVPersister<Self>, Error> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error("create", &dir, e))?;
        let data = load(&dir)?;
        info!("opened {} with {} keys", dir.display(), data.len());
        Ok(KVVPersister(Self { dir, data: Mutex::new(data) }))
    }

    /// The directory holding the store
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(file_name(key))
    }

    fn write(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error> {
        let path = self.path(key);
        let key_len = u32::try_from(key.len())
            .map_err(|_| Error::Internal(format!("key of {} bytes", key.len())))?;
        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| io_error("create", &path, e))?;
        file.write_all(&version.to_be_bytes()).map_err(|e| io_error("write", &path, e))?;
        file.write_all(&key_len.to_be_bytes()).map_err(|e| io_error("write", &path, e))?;
        file.write_all(key.as_bytes()).map_err(|e| io_error("write", &path, e))?;
        file.write_all(value).map_err(|e| io_error("write", &path, e))?;
        file.as_file().sync_all().map_err(|e| io_error("sync", &path, e))?;
        file.persist(&path).map_err(|e| io_error("rename", &path, e.error))?;
        self.sync_dir()?;
        trace!("wrote {} version {}", key, version);
        Ok(())
    }

    // Make renames and removals durable
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), Error> {
        fs::File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error("sync", &self.dir, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl SendSync for FileKVVStore {}

impl KVVStore for FileKVVStore {
    type Iter = Iter;

    #[instrument(skip(self, value))]
    fn put_with_version(&self, key: &str, version: u64, value: &[u8]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        if check_version(key, version, value, data.get(key))? {
            self.write(key, version, value)?;
            data.insert(key.to_string(), (version, value.to_vec()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn put_batch(&self, kvvs: &[&KVV]) -> Result<(), Error> {
        let mut data = self.data.lock().unwrap();
        for kvv in kvvs {
            let (version, value) = &kvv.1;
            check_version(&kvv.0, *version, value, data.get(&kvv.0))?;
        }
        for kvv in kvvs {
            let (version, value) = &kvv.1;
            self.write(&kvv.0, *version, value)?;
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
        let mut data = self.data.lock().unwrap();
        for key in data.keys() {
            let path = self.path(key);
            fs::remove_file(&path).map_err(|e| io_error("remove", &path, e))?;
        }
        data.clear();
        self.sync_dir()
    }
}

// Read every key file in `dir`.  Leftover temporary files are skipped.
fn load(dir: &Path) -> Result<BTreeMap<String, (u64, Vec<u8>)>, Error> {
    let mut data = BTreeMap::new();
    for dirent in fs::read_dir(dir).map_err(|e| io_error("list", dir, e))? {
        let dirent = dirent.map_err(|e| io_error("list", dir, e))?;
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            debug!("skipping {}", name);
            continue;
        }
        let path = dirent.path();
        let contents = fs::read(&path).map_err(|e| io_error("read", &path, e))?;
        let (key, version, value) = decode_file(&contents)
            .ok_or_else(|| Error::Internal(format!("malformed {}", path.display())))?;
        if file_name(&key) != name {
            return Err(Error::Internal(format!("{} holds key {}", path.display(), key)));
        }
        data.insert(key, (version, value.to_vec()));
    }
    Ok(data)
}

fn file_name(key: &str) -> String {
    hex::encode(sha256(key.as_bytes()))
}

// Split file contents into key, version and value
fn decode_file(contents: &[u8]) -> Option<(String, u64, &[u8])> {
    if contents.len() < HEADER_LEN {
        return None;
    }
    let (header, rest) = contents.split_at(HEADER_LEN);
    let version = u64::from_be_bytes(header[..VERSION_LEN].try_into().ok()?);
    let key_len = u32::from_be_bytes(header[VERSION_LEN..].try_into().ok()?) as usize;
    if rest.len() < key_len {
        return None;
    }
    let (key, value) = rest.split_at(key_len);
    let key = String::from_utf8(key.to_vec()).ok()?;
    Some((key, version, value))
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> Error {
    error!("{} {}: {}", op, path.display(), e);
    Error::Unavailable(format!("{} {}: {}", op, path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn reopen_test() {
        let tmpdir = tempfile::tempdir().unwrap();
        {
            let store = FileKVVStore::new(tmpdir.path()).unwrap();
            store.put("channel/01", &[1, 2, 3]).unwrap();
            store.put("channel/01", &[4]).unwrap();
            store.put("channel/02", &[5]).unwrap();
            store.delete("channel/02").unwrap();
        }
        let store = FileKVVStore::new(tmpdir.path()).unwrap();
        assert_eq!(store.get("channel/01").unwrap(), Some((1, vec![4])));
        assert_eq!(store.get("channel/02").unwrap(), Some((1, vec![])));
        assert!(matches!(
            store.put_with_version("channel/01", 0, &[9]),
            Err(Error::VersionMismatch(_))
        ));
    }

    #[test]
    fn leftover_temp_file_test() {
        let tmpdir = tempfile::tempdir().unwrap();
        fs::write(tmpdir.path().join(".tmpXYZ"), b"partial").unwrap();
        let store = FileKVVStore::new(tmpdir.path()).unwrap();
        assert_eq!(store.get_prefix("").unwrap().count(), 0);
    }

    #[test]
    fn corrupt_file_test() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join(file_name("k"));
        fs::write(&path, [0u8; 3]).unwrap();
        assert!(matches!(FileKVVStore::new(tmpdir.path()), Err(Error::Internal(_))));
        // key length past the end
        fs::write(&path, [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 9, b'k']).unwrap();
        assert!(matches!(FileKVVStore::new(tmpdir.path()), Err(Error::Internal(_))));
        fs::write(&path, [0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 1, b'k', 7]).unwrap();
        let store = FileKVVStore::new(tmpdir.path()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some((1, vec![7])));
        drop(store);
        // a file named for another key
        fs::rename(&path, tmpdir.path().join(file_name("j"))).unwrap();
        assert!(matches!(FileKVVStore::new(tmpdir.path()), Err(Error::Internal(_))));
    }

    #[test]
    fn long_key_test() {
        let tmpdir = tempfile::tempdir().unwrap();
        let key = format!("channel/{}", "ab".repeat(300));
        {
            let store = FileKVVStore::new(tmpdir.path()).unwrap();
            store.put(&key, &[1, 2]).unwrap();
        }
        let names: Vec<_> = fs::read_dir(tmpdir.path())
            .unwrap()
            .map(|dirent| dirent.unwrap().file_name().len())
            .collect();
        assert_eq!(names, vec![64]);
        let store = FileKVVStore::new(tmpdir.path()).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some((0, vec![1, 2])));
    }

    #[test]
    fn clear_database_test() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = FileKVVStore::new(tmpdir.path()).unwrap();
        store.put("a", &[1]).unwrap();
        store.put("b", &[2]).unwrap();
        store.clear_database().unwrap();
        assert_eq!(fs::read_dir(tmpdir.path()).unwrap().count(), 0);
        let store = FileKVVStore::new(tmpdir.path()).unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }
}

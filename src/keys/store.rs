//! The directory holding the keys of a zone.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use domain::base::iana::SecurityAlgorithm;
use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::util::{self, Owner};

use super::keyfile::{self, ParseError};
use super::{Key, TimingField};

/// File extensions that belong to a key, besides `.key`.
const COMPANION_EXTENSIONS: [&str; 3] = ["private", "ds", "state"];

//------------ KeyStore ------------------------------------------------------

/// Access to the key files of one zone in a directory.
///
/// This is the only place that touches key files. Other zones may keep
/// their keys in the same directory; their files are ignored.
#[derive(Clone, Debug)]
pub struct KeyStore {
    dir: PathBuf,

    /// The zone apex with a trailing dot, in lower case.
    zone: String,

    /// The owner to give new key files.
    owner: Option<Owner>,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, zone: &str) -> Self {
        let mut zone = zone.to_ascii_lowercase();
        if !zone.ends_with('.') {
            zone.push('.');
        }
        Self {
            dir: dir.into(),
            zone,
            owner: None,
        }
    }

    pub fn with_owner(self, owner: Option<Owner>) -> Self {
        Self { owner, ..self }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// The path of a file of a key.
    pub fn path(&self, base: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{base}.{extension}"))
    }

    /// Try to take the lock for this zone.
    ///
    /// Returns `None` if another process holds it. The lock is released when
    /// the returned [`DirLock`] is dropped, or by the operating system when
    /// the process ends.
    pub fn lock(&self) -> Result<Option<DirLock>, StorageError> {
        let path = self.dir.join(format!(".keyroll-{}lock", self.zone));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StorageError::new(&path, format!("unable to open lock file: {e}")))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired lock {}", path.display());
                Ok(Some(DirLock { file, path }))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(StorageError::new(&path, format!("unable to lock: {e}"))),
        }
    }

    /// List the keys of the zone.
    ///
    /// Files that look like keys of the zone but cannot be read are skipped
    /// and listed separately. Only a directory that cannot be read at all is
    /// an error.
    pub fn list_keys(&self) -> Result<Listing, StorageError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StorageError::new(&self.dir, format!("unable to read directory: {e}")))?;

        let prefix = format!("K{}+", self.zone);
        let mut listing = Listing::default();
        for entry in entries {
            let entry = entry
                .map_err(|e| StorageError::new(&self.dir, format!("unable to read directory: {e}")))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(base) = file_name.strip_suffix(".key") else {
                continue;
            };
            if !base.to_ascii_lowercase().starts_with(&prefix) {
                continue;
            }

            match self.load_key(base) {
                Ok(key) => listing.keys.push(key),
                Err(e) => {
                    warn!("skipping {}: {e}", entry.path().display());
                    listing.skipped.push(SkippedFile {
                        path: entry.path(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        listing
            .keys
            .sort_by(|a, b| (a.created(), a.base_name()).cmp(&(b.created(), b.base_name())));
        Ok(listing)
    }

    /// Load a single key by its base name.
    pub fn load_key(&self, base: &str) -> Result<Key, StorageError> {
        let path = self.path(base, "key");
        let text = fs::read_to_string(&path)
            .map_err(|e| StorageError::new(&path, format!("unable to read: {e}")))?;
        let parsed = keyfile::parse_public(base, &text)
            .map_err(|e: ParseError| StorageError::new(&path, e))?;

        let private_path = self.path(base, "private");
        if let Ok(text) = fs::read_to_string(&private_path) {
            match keyfile::parse_private_timing(&text) {
                Ok(timing) if timing != parsed.timing => warn!(
                    "timing metadata of {} differs from {}, using the latter",
                    private_path.display(),
                    path.display()
                ),
                Ok(_) => {}
                Err(e) => warn!("{}: {e}", private_path.display()),
            }
        }

        Ok(Key::new(
            base.to_string(),
            parsed.owner,
            parsed.role,
            SecurityAlgorithm::from_int(parsed.algorithm),
            parsed.key_tag,
            parsed.timing,
        ))
    }

    /// Persist the timing metadata of a key.
    ///
    /// The private key file is written first, as that is the copy the name
    /// server acts on. Both writes are durable when this returns.
    pub fn write_key(&self, key: &Key) -> Result<(), StorageError> {
        let private_path = self.path(key.base_name(), "private");
        match fs::read_to_string(&private_path) {
            Ok(text) => {
                let text = keyfile::update_private(&text, key.timing());
                util::write_to_new_and_rename(&private_path, &text)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} has no private key file", key.base_name());
            }
            Err(e) => {
                return Err(StorageError::new(
                    &private_path,
                    format!("unable to read: {e}"),
                ))
            }
        }

        let public_path = self.path(key.base_name(), "key");
        let text = fs::read_to_string(&public_path)
            .map_err(|e| StorageError::new(&public_path, format!("unable to read: {e}")))?;
        let text = keyfile::update_public(
            &text,
            key.owner(),
            key.role(),
            key.key_tag(),
            key.timing(),
        );
        util::write_to_new_and_rename(&public_path, &text)
    }

    /// Delete the files of a key.
    ///
    /// The public key file must exist. It is removed last, so that an
    /// interrupted removal is picked up again by the next listing.
    pub fn remove_key(&self, key: &Key) -> Result<(), StorageError> {
        let public_path = self.path(key.base_name(), "key");
        if !public_path.exists() {
            return Err(StorageError::new(&public_path, "key file does not exist"));
        }
        for extension in COMPANION_EXTENSIONS {
            let path = self.path(key.base_name(), extension);
            if path.exists() {
                util::remove_path(&path)?;
            }
        }
        util::remove_path(&public_path)
    }

    /// Take ownership of the files of a freshly generated key.
    ///
    /// Applies the configured owner and restricts the private key file,
    /// then loads the key.
    pub fn adopt(&self, base: &str) -> Result<Key, StorageError> {
        let private_path = self.path(base, "private");
        if private_path.exists() {
            util::make_private(&private_path)?;
        }
        if let Some(owner) = &self.owner {
            for extension in ["key"].into_iter().chain(COMPANION_EXTENSIONS) {
                let path = self.path(base, extension);
                if path.exists() {
                    owner.apply(&path)?;
                }
            }
        }
        self.load_key(base)
    }

    /// The DS record of a key, if a `.ds` file exists for it.
    pub fn ds_record(&self, key: &Key) -> Option<String> {
        fs::read_to_string(self.path(key.base_name(), "ds"))
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    }

    /// Record that the DS record of a key was seen at the parent.
    pub fn confirm_ds(&self, key: &mut Key, now: DateTime<Utc>) -> Result<(), StorageError> {
        key.stamp(TimingField::DsPublish, now);
        self.write_key(key)
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

//------------ Listing -------------------------------------------------------

/// The result of listing a key directory.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    /// The readable keys of the zone, ordered by creation time.
    pub keys: Vec<Key>,

    /// Files that could not be read as keys.
    pub skipped: Vec<SkippedFile>,
}

/// A file that was ignored while listing keys.
#[derive(Clone, Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

//------------ DirLock -------------------------------------------------------

/// Exclusive ownership of a zone's keys for the duration of a run.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("unable to release lock {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyState, Role};
    use chrono::TimeZone;
    use tempfile::TempDir;

    const PUBLIC: &str = "\
; This is a zone-signing key, keyid 4242, for example.test.
; Created: 20240101000000 (Mon Jan  1 00:00:00 2024)
; Publish: 20240101000000 (Mon Jan  1 00:00:00 2024)
; Activate: 20240101000000 (Mon Jan  1 00:00:00 2024)
example.test. IN DNSKEY 256 3 13 dGVzdA==
";

    fn setup() -> (TempDir, KeyStore) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("Kexample.test.+013+04242.key"), PUBLIC).unwrap();
        fs::write(
            dir.path().join("Kexample.test.+013+04242.private"),
            "Private-key-format: v1.3\nAlgorithm: 13 (ECDSAP256SHA256)\nPrivateKey: c2VjcmV0\n",
        )
        .unwrap();
        let store = KeyStore::new(dir.path(), "example.test");
        (dir, store)
    }

    #[test]
    fn list_skips_foreign_and_broken_files() {
        let (dir, store) = setup();
        fs::write(dir.path().join("Kexample.test.+013+00001.key"), "garbage\n").unwrap();
        fs::write(dir.path().join("Kother.test.+013+00002.key"), PUBLIC).unwrap();
        fs::write(dir.path().join("README"), "not a key\n").unwrap();

        let listing = store.list_keys().unwrap();
        assert_eq!(listing.keys.len(), 1);
        assert_eq!(listing.keys[0].key_tag(), 4242);
        assert_eq!(listing.keys[0].role(), Role::Zsk);
        assert_eq!(listing.skipped.len(), 1);
        assert!(listing.skipped[0].path.ends_with("Kexample.test.+013+00001.key"));
    }

    #[test]
    fn write_updates_both_files() {
        let (dir, store) = setup();
        let mut key = store.list_keys().unwrap().keys.remove(0);
        let retired = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        key.stamp(TimingField::Inactive, retired);
        store.write_key(&key).unwrap();

        let reloaded = store.load_key(key.base_name()).unwrap();
        assert_eq!(reloaded, key);
        assert_eq!(reloaded.status(retired).state, KeyState::Retired);

        let private =
            fs::read_to_string(dir.path().join("Kexample.test.+013+04242.private")).unwrap();
        assert!(private.contains("PrivateKey: c2VjcmV0\n"));
        assert!(private.contains("Inactive: 20240201000000\n"));
    }

    #[test]
    fn remove_deletes_all_files() {
        let (dir, store) = setup();
        fs::write(dir.path().join("Kexample.test.+013+04242.ds"), "ds\n").unwrap();
        let key = store.list_keys().unwrap().keys.remove(0);
        store.remove_key(&key).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(store.remove_key(&key).is_err());
    }

    #[test]
    fn lock_is_exclusive() {
        let (_dir, store) = setup();
        let lock = store.lock().unwrap();
        assert!(lock.is_some());
        assert!(store.lock().unwrap().is_none());
        drop(lock);
        assert!(store.lock().unwrap().is_some());
    }
}

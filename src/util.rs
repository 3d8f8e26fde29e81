//! A utility module for common file operations.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

#[cfg(unix)]
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use crate::error::StorageError;

/// Create and open a file that must not exist yet.
pub fn create_new_file(path: impl AsRef<Path>) -> Result<File, StorageError> {
    let path = path.as_ref();
    File::create_new(path).map_err(|err| StorageError::new(path, format!("cannot create: {err}")))
}

/// Write a file by first writing to a new file and then renaming it.
///
/// The new content is on disk before the rename, so readers only ever see
/// the old or the new version, also after a crash. Ownership and mode of an
/// existing file are carried over.
pub fn write_to_new_and_rename(path: &Path, content: &str) -> Result<(), StorageError> {
    let mut new_path = path.to_path_buf();
    new_path.as_mut_os_string().push(".new");

    let mut file =
        File::create(&new_path).map_err(|e| StorageError::new(&new_path, format!("unable to create: {e}")))?;
    file.write_all(content.as_bytes())
        .map_err(|e| StorageError::new(&new_path, format!("unable to write: {e}")))?;
    file.sync_all()
        .map_err(|e| StorageError::new(&new_path, format!("unable to sync: {e}")))?;

    #[cfg(unix)]
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(&new_path, metadata.permissions())
            .map_err(|e| StorageError::new(&new_path, format!("unable to set mode: {e}")))?;
        let current = file
            .metadata()
            .map_err(|e| StorageError::new(&new_path, e))?;
        if current.uid() != metadata.uid() || current.gid() != metadata.gid() {
            std::os::unix::fs::chown(&new_path, Some(metadata.uid()), Some(metadata.gid()))
                .map_err(|e| StorageError::new(&new_path, format!("unable to change owner: {e}")))?;
        }
    }
    drop(file);

    fs::rename(&new_path, path).map_err(|e| {
        StorageError::new(
            path,
            format!("unable to rename {} into place: {e}", new_path.display()),
        )
    })?;
    sync_parent(path)
}

/// Remove a file.
pub fn remove_path(path: &Path) -> Result<(), StorageError> {
    fs::remove_file(path).map_err(|e| StorageError::new(path, format!("unable to remove: {e}")))
}

/// Make a rename or removal in the parent directory durable.
fn sync_parent(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| StorageError::new(parent, format!("unable to sync directory: {e}")))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Restrict a file to its owner.
#[cfg(unix)]
pub fn make_private(path: &Path) -> Result<(), StorageError> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| StorageError::new(path, format!("unable to set mode: {e}")))
}

#[cfg(not(unix))]
pub fn make_private(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

//------------ Owner ---------------------------------------------------------

/// The owner to give newly created key files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: Option<u32>,
}

impl Owner {
    /// Change the owner of a file.
    #[cfg(unix)]
    pub fn apply(&self, path: &Path) -> Result<(), StorageError> {
        std::os::unix::fs::chown(path, Some(self.uid), self.gid)
            .map_err(|e| StorageError::new(path, format!("unable to change owner: {e}")))
    }

    #[cfg(not(unix))]
    pub fn apply(&self, _path: &Path) -> Result<(), StorageError> {
        Ok(())
    }
}

impl FromStr for Owner {
    type Err = String;

    /// Parse `user[:group]` where both may be names or numeric ids.
    ///
    /// Without a group, the primary group of the user is used.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, group) = match s.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (s, None),
        };
        if user.is_empty() {
            return Err(format!("missing user in owner '{s}'"));
        }

        let (uid, primary_gid) = match user.parse::<u32>() {
            Ok(uid) => (uid, None),
            Err(_) => {
                let (uid, gid) =
                    lookup_user(user)?.ok_or_else(|| format!("unknown user '{user}'"))?;
                (uid, Some(gid))
            }
        };
        let gid = match group {
            Some(group) => Some(match group.parse::<u32>() {
                Ok(gid) => gid,
                Err(_) => {
                    lookup_group(group)?.ok_or_else(|| format!("unknown group '{group}'"))?
                }
            }),
            None => primary_gid,
        };
        Ok(Owner { uid, gid })
    }
}

/// Look up the uid and primary gid of a user name.
#[cfg(unix)]
fn lookup_user(name: &str) -> Result<Option<(u32, u32)>, String> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|e| format!("unable to look up user '{name}': {e}"))?;
    Ok(user.map(|user| (user.uid.as_raw(), user.gid.as_raw())))
}

/// Look up the gid of a group name.
#[cfg(unix)]
fn lookup_group(name: &str) -> Result<Option<u32>, String> {
    let group = nix::unistd::Group::from_name(name)
        .map_err(|e| format!("unable to look up group '{name}': {e}"))?;
    Ok(group.map(|group| group.gid.as_raw()))
}

#[cfg(not(unix))]
fn lookup_user(name: &str) -> Result<Option<(u32, u32)>, String> {
    Err(format!("user names like '{name}' are not supported on this system"))
}

#[cfg(not(unix))]
fn lookup_group(name: &str) -> Result<Option<u32>, String> {
    Err(format!("group names like '{name}' are not supported on this system"))
}

//! Credential payload and the file OpenVPN reads it from
//!
//! OpenVPN's `--auth-user-pass <file>` expects the username on the first line
//! and the password on the second. For a SAML login the username is a dummy
//! and the password is `CRV1::<sid>::<saml response>`.
//!
//! The file holds a live session token, so it is created owner-only, replaced
//! rather than reused, and wiped as soon as OpenVPN no longer needs it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::MAX_CREDENTIALS_PERMISSIONS;

const USERNAME_PLACEHOLDER: &str = "N/A";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Session ID is empty")]
    EmptySid,
    #[error("SAML response is empty")]
    EmptyAssertion,
    #[error("Could not delete old credentials file {path}: {source}")]
    RemoveStale { path: PathBuf, source: io::Error },
    #[error("Could not write credentials file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Build the `--auth-user-pass` payload for a SAML session.
pub fn materialize(sid: &str, assertion: &str) -> Result<Zeroizing<String>, CredentialError> {
    if sid.is_empty() {
        return Err(CredentialError::EmptySid);
    }
    if assertion.is_empty() {
        return Err(CredentialError::EmptyAssertion);
    }
    Ok(Zeroizing::new(format!(
        "{}\nCRV1::{}::{}",
        USERNAME_PLACEHOLDER, sid, assertion
    )))
}

/// A credentials file on disk that is wiped and removed when dropped.
#[derive(Debug)]
pub struct CredentialFile {
    path: PathBuf,
    len: usize,
    state: Mutex<FileState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Present,
    Erased,
    Persisted,
}

impl CredentialFile {
    /// Write `contents` to `path`, replacing whatever was there.
    ///
    /// `mode` is clamped to owner read/write.
    pub fn create(path: &Path, contents: &str, mode: u32) -> Result<Self, CredentialError> {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed stale credentials file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CredentialError::RemoveStale {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let write_err = |source: io::Error| CredentialError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode & MAX_CREDENTIALS_PERMISSIONS);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(path).map_err(write_err)?;
        file.write_all(contents.as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        info!("Saved credentials to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            len: contents.len(),
            state: Mutex::new(FileState::Present),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the file with zeros and delete it. Safe to call repeatedly.
    pub fn erase(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != FileState::Present {
            return;
        }
        *state = FileState::Erased;

        if let Err(e) = wipe(&self.path, self.len) {
            warn!("Could not overwrite {}: {}", self.path.display(), e);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Erased credentials file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete {}: {}", self.path.display(), e),
        }
    }

    /// Leave the file on disk after this value is dropped.
    pub fn persist(self) -> PathBuf {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state == FileState::Present {
            *state = FileState::Persisted;
            warn!(
                "Credentials stay in {} until you delete them",
                self.path.display()
            );
        }
        drop(state);
        self.path.clone()
    }

    pub fn is_erased(&self) -> bool {
        self.state
            .lock()
            .map(|state| *state == FileState::Erased)
            .unwrap_or(false)
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        self.erase();
    }
}

fn wipe(path: &Path, len: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len])?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_materialize_format() {
        let payload = materialize("SID123", "assertionXYZ").unwrap();
        assert_eq!(payload.as_str(), "N/A\nCRV1::SID123::assertionXYZ");
    }

    #[test]
    fn test_materialize_rejects_empty_inputs() {
        assert!(matches!(
            materialize("", "assertion").unwrap_err(),
            CredentialError::EmptySid
        ));
        assert!(matches!(
            materialize("sid", "").unwrap_err(),
            CredentialError::EmptyAssertion
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");
        let payload = materialize("SID123", "assertionXYZ").unwrap();

        let file = CredentialFile::create(&path, &payload, 0o600).unwrap();

        let bytes = fs::read(file.path()).unwrap();
        assert_eq!(bytes, b"N/A\nCRV1::SID123::assertionXYZ");
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_are_clamped() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");

        let file = CredentialFile::create(&path, "secret", 0o644).unwrap();

        let mode = fs::metadata(file.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & !0o600, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_file_can_still_be_erased() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");

        let file = CredentialFile::create(&path, "secret", 0o400).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "secret");

        file.erase();
        assert!(!path.exists());
        assert!(file.is_erased());
    }

    #[test]
    fn test_stale_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");
        fs::write(&path, "old contents that are much longer than the new ones").unwrap();

        let _file = CredentialFile::create(&path, "new", 0o600).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_drop_erases() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");

        {
            let _file = CredentialFile::create(&path, "secret", 0o600).unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_erase_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");
        let file = CredentialFile::create(&path, "secret", 0o600).unwrap();

        file.erase();
        file.erase();
        drop(file);

        assert!(!path.exists());
    }

    #[test]
    fn test_persist_keeps_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds");
        let file = CredentialFile::create(&path, "secret", 0o600).unwrap();

        let kept = file.persist();

        assert_eq!(kept, path);
        assert_eq!(fs::read_to_string(&path).unwrap(), "secret");
    }

    #[test]
    fn test_missing_directory() {
        let result = CredentialFile::create(Path::new("/nonexistent/dir/creds"), "secret", 0o600);
        assert!(matches!(result.unwrap_err(), CredentialError::Write { .. }));
    }
}

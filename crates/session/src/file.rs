//! File-backed session store
//!
//! Persists the session as a small JSON document using the same field names
//! as the browser cookies (`accessToken`, `refreshToken`, `userId`). All
//! writes go through a temp file + rename so a crash never leaves a
//! half-written session on disk, and the file is created `0600` because it
//! holds both tokens.

use std::path::{Path, PathBuf};

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::Session;
use crate::store::{SessionStore, StoreFuture};

/// On-disk representation. `userId` is a numeric string, matching the cookie.
#[derive(Serialize, Deserialize)]
struct PersistedSession {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    #[serde(rename = "userId")]
    user_id: String,
}

impl PersistedSession {
    fn into_session(self) -> Result<Session> {
        let subject_id = self
            .user_id
            .parse::<u64>()
            .map_err(|e| Error::Parse(format!("userId is not numeric: {e}")))?;
        Ok(Session::new(self.access_token, self.refresh_token, subject_id))
    }
}

/// Session store backed by a single JSON file.
///
/// The in-memory copy is authoritative for reads; the Mutex serializes
/// writers so the file and memory never disagree.
pub struct FileSessionStore {
    path: PathBuf,
    state: Mutex<Option<Session>>,
}

impl FileSessionStore {
    /// Load the session from `path`. A missing file means signed out.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let persisted: PersistedSession = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing session file: {e}")))?;
            let session = persisted.into_session()?;
            info!(path = %path.display(), subject_id = session.subject_id, "loaded session");
            Some(session)
        } else {
            info!(path = %path.display(), "no session file, starting signed out");
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn write(&self, session: Session) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            write_atomic(&self.path, &session).await?;
            debug!(subject_id = session.subject_id, "session written");
            *state = Some(session);
            Ok(())
        })
    }

    fn read_access_credential(&self) -> StoreFuture<'_, Option<Secret<String>>> {
        Box::pin(async move { self.state.lock().await.as_ref().map(|s| s.access.clone()) })
    }

    fn read_refresh_credential(&self) -> StoreFuture<'_, Option<Secret<String>>> {
        Box::pin(async move { self.state.lock().await.as_ref().map(|s| s.refresh.clone()) })
    }

    fn read_subject_id(&self) -> StoreFuture<'_, Option<u64>> {
        Box::pin(async move { self.state.lock().await.as_ref().map(|s| s.subject_id) })
    }

    fn clear(&self) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => debug!(path = %self.path.display(), "removed session file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(format!("removing session file: {e}"))),
            }
            *state = None;
            Ok(())
        })
    }
}

/// Write the session to a file atomically with owner-only permissions.
async fn write_atomic(path: &Path, session: &Session) -> Result<()> {
    let persisted = PersistedSession {
        access_token: session.access.expose().clone(),
        refresh_token: session.refresh.expose().clone(),
        user_id: session.subject_id.to_string(),
    };
    let json = serde_json::to_string_pretty(&persisted)
        .map_err(|e| Error::Parse(format!("serializing session: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".session.tmp.{}", std::process::id()));

    let result = write_then_rename(&tmp_path, path, json.as_bytes()).await;
    if result.is_err() {
        // Never leave token material behind in a stray temp file
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result
}

async fn write_then_rename(tmp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(tmp_path)
        .await
        .map_err(|e| Error::Io(format!("creating temp session file: {e}")))?;

    // A leftover temp file keeps its old mode; tighten it before writing
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    file.write_all(contents)
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("syncing temp session file: {e}")))?;
    drop(file);

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileSessionStore::load(path.clone()).await.unwrap();
        store.write(Session::new("at_1", "rt_1", 42)).await.unwrap();

        let reloaded = FileSessionStore::load(path).await.unwrap();
        assert_eq!(
            reloaded.read_access_credential().await.unwrap().expose(),
            "at_1"
        );
        assert_eq!(
            reloaded.read_refresh_credential().await.unwrap().expose(),
            "rt_1"
        );
        assert_eq!(reloaded.read_subject_id().await, Some(42));
    }

    #[tokio::test]
    async fn file_uses_cookie_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileSessionStore::load(path.clone()).await.unwrap();
        store.write(Session::new("at_x", "rt_x", 5)).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["accessToken"], "at_x");
        assert_eq!(json["refreshToken"], "rt_x");
        assert_eq!(json["userId"], "5");
    }

    #[tokio::test]
    async fn clear_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileSessionStore::load(path.clone()).await.unwrap();
        store.write(Session::new("at", "rt", 1)).await.unwrap();
        assert!(path.exists());

        store.clear().await.unwrap();
        store.clear().await.unwrap();

        assert!(!path.exists());
        assert!(store.read_access_credential().await.is_none());
        assert!(store.read_refresh_credential().await.is_none());
        assert!(store.read_subject_id().await.is_none());
    }

    #[tokio::test]
    async fn non_numeric_user_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(
            &path,
            r#"{"accessToken":"at","refreshToken":"rt","userId":"abc"}"#,
        )
        .await
        .unwrap();

        let result = FileSessionStore::load(path).await;
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = FileSessionStore::load(path.clone()).await.unwrap();
        store.write(Session::new("at", "rt", 1)).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "session file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = FileSessionStore::load(path.clone()).await.unwrap();

        // A non-empty directory at the target makes the rename fail
        tokio::fs::create_dir(&path).await.unwrap();
        tokio::fs::write(path.join("occupied"), b"x").await.unwrap();

        let result = store.write(Session::new("at", "rt", 1)).await;
        assert!(matches!(result, Err(Error::Io(_))));

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.starts_with(".session.tmp"), "stray temp file {name}");
        }
    }
}

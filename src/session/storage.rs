//! On-disk session storage.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::{SessionError, SessionResult};

/// Suffix of session directories.
pub const SESSION_DIR_SUFFIX: &str = ".session";
/// Name of the checkpoint file inside a session directory.
pub const SESSION_FILE: &str = "session";
pub const IO_LOG_DIR: &str = "io-logs";
pub const SHARE_DIR: &str = "session-share";

/// The directory holding every stored session.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    root: PathBuf,
}

impl SessionRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directories of a new session with a fresh id.
    pub fn create(&self) -> SessionResult<SessionStorage> {
        let id = uuid::Uuid::new_v4().to_string();
        let storage = SessionStorage::new(&id, self.session_dir(&id)?);
        std::fs::create_dir_all(storage.io_log_dir())?;
        std::fs::create_dir_all(storage.share_dir())?;
        debug!("Created session storage at {}", storage.location().display());
        Ok(storage)
    }

    pub fn open(&self, id: &str) -> SessionResult<SessionStorage> {
        let location = self.session_dir(id)?;
        if !location.is_dir() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        Ok(SessionStorage::new(id, location))
    }

    /// Every stored session, sorted by id.
    pub fn list(&self) -> SessionResult<Vec<SessionStorage>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut sessions: Vec<SessionStorage> = std::fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let id = name.strip_suffix(SESSION_DIR_SUFFIX)?.to_string();
                Some(SessionStorage::new(&id, entry.path()))
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    pub fn remove(&self, id: &str) -> SessionResult<()> {
        let storage = self.open(id)?;
        std::fs::remove_dir_all(storage.location())?;
        debug!("Removed session {}", id);
        Ok(())
    }

    /// Ids name a single directory directly under the root.
    fn session_dir(&self, id: &str) -> SessionResult<PathBuf> {
        let mut components = Path::new(id).components();
        let single = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !single || id.contains(['/', '\\']) {
            return Err(SessionError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(format!("{}{}", id, SESSION_DIR_SUFFIX)))
    }
}

/// The storage of one session.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    id: String,
    location: PathBuf,
}

impl SessionStorage {
    fn new(id: &str, location: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            location,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn session_file(&self) -> PathBuf {
        self.location.join(SESSION_FILE)
    }

    pub fn io_log_dir(&self) -> PathBuf {
        self.location.join(IO_LOG_DIR)
    }

    pub fn share_dir(&self) -> PathBuf {
        self.location.join(SHARE_DIR)
    }

    /// Replaces the checkpoint atomically.
    ///
    /// The data is written to a temporary file in the session directory,
    /// synced, then renamed over the previous checkpoint, so a crash leaves
    /// either the old or the new checkpoint in place.
    pub fn save_checkpoint(&self, data: &[u8]) -> SessionResult<()> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.location)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(self.session_file())
            .map_err(|e| SessionError::Io(e.error))?;
        debug!("Checkpointed session {} ({} bytes)", self.id, data.len());
        Ok(())
    }

    /// Reads the checkpoint; `None` when none was written yet.
    pub fn load_checkpoint(&self) -> SessionResult<Option<Vec<u8>>> {
        match std::fs::read(self.session_file()) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

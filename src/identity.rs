//! Agent identity persisted across restarts.
//!
//! Persistence is best-effort: a missing or corrupt file yields a freshly
//! minted identity, and failing to write it back only costs the agent its
//! name on the next start.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use uuid::Uuid;

const IDENTITY_FILE_NAME: &str = "agent-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity(String);

impl AgentIdentity {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn load_or_mint(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match Uuid::parse_str(raw.trim()) {
                Ok(id) => return Self(id.to_string()),
                Err(error) => tracing::warn!(
                    target = "agent_dispatch::identity",
                    path = %path.display(),
                    error = %error,
                    "stored agent id is not a valid uuid, minting a new one"
                ),
            },
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => tracing::warn!(
                target = "agent_dispatch::identity",
                path = %path.display(),
                error = %error,
                "failed to read stored agent id, minting a new one"
            ),
        }

        let identity = Self::generate();
        match identity.persist(path) {
            Ok(()) => tracing::info!(
                target = "agent_dispatch::identity",
                path = %path.display(),
                agent_id = %identity,
                "minted new agent id"
            ),
            Err(error) => tracing::warn!(
                target = "agent_dispatch::identity",
                path = %path.display(),
                error = %error,
                "failed to persist agent id"
            ),
        }
        identity
    }

    fn persist(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.0)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn default_identity_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("agent-dispatch").join(IDENTITY_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(IDENTITY_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::AgentIdentity;

    #[test]
    fn mints_and_persists_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("agent-id");

        let identity = AgentIdentity::load_or_mint(&path);

        assert!(Uuid::parse_str(identity.as_str()).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), identity.as_str());
    }

    #[test]
    fn reloads_the_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-id");

        let first = AgentIdentity::load_or_mint(&path);
        let second = AgentIdentity::load_or_mint(&path);
        assert_eq!(first, second);
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-id");
        std::fs::write(&path, "definitely not a uuid").unwrap();

        let identity = AgentIdentity::load_or_mint(&path);

        assert_ne!(identity.as_str(), "definitely not a uuid");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), identity.as_str());
    }

    #[test]
    fn unwritable_location_still_yields_an_identity() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();

        let identity = AgentIdentity::load_or_mint(&blocker.join("agent-id"));
        assert!(Uuid::parse_str(identity.as_str()).is_ok());
    }
}

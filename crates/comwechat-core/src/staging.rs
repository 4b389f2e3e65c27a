use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// Outbound files copied into the chat client's directory, deleted once the
/// grace window has passed.
#[derive(Debug)]
pub struct StagedFiles {
    grace: Duration,
    entries: Mutex<HashMap<PathBuf, Instant>>,
}

impl StagedFiles {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn stage(&self, path: impl Into<PathBuf>) {
        self.stage_at(path, Instant::now());
    }

    pub fn stage_at(&self, path: impl Into<PathBuf>, now: Instant) {
        self.entries.lock().insert(path.into(), now);
    }

    /// Deletes every file staged more than the grace window before `now`.
    /// Deletion errors are ignored; the entry is dropped either way.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PathBuf> = {
            let mut entries = self.entries.lock();
            let expired: Vec<PathBuf> = entries
                .iter()
                .filter(|(_, staged)| now.saturating_duration_since(**staged) > self.grace)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &expired {
                entries.remove(path);
            }
            expired
        };

        for path in &expired {
            if let Err(err) = std::fs::remove_file(path) {
                debug!("staged file {} not removed: {err}", path.display());
            }
        }
        expired.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(120);

    #[test]
    fn files_survive_the_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg").unwrap();

        let staged = StagedFiles::new(GRACE);
        let start = Instant::now();
        staged.stage_at(&path, start);

        assert_eq!(staged.sweep(start + GRACE), 0);
        assert!(path.exists());

        assert_eq!(staged.sweep(start + GRACE + Duration::from_secs(1)), 1);
        assert!(!path.exists());
        assert!(staged.is_empty());
    }

    #[test]
    fn missing_files_are_still_untracked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("already-gone.bin");

        let staged = StagedFiles::new(GRACE);
        let start = Instant::now();
        staged.stage_at(&path, start);
        assert!(staged.contains(&path));

        assert_eq!(staged.sweep(start + GRACE * 2), 1);
        assert!(!staged.contains(&path));
    }
}

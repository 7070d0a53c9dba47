//! Journaled atomic writes — backup, write, validate, commit-or-rollback.
//!
//! A surgery on `<target>` proceeds CLEAN → BACKED_UP → WRITTEN →
//! VALIDATED → COMMITTED, with ROLLED_BACK as the failure terminal. The
//! pre-mutation bytes live in a `<target>.journal` sidecar for the
//! duration; a sidecar found at startup means a crash mid-surgery, and
//! rolling it back restores the pre-mutation bytes. Validation also runs
//! pre-flight, before anything touches disk, so a syntactically broken
//! payload never mutates the target at all.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::parser;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Terminal result of one surgery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack { reason: String },
}

impl Outcome {
    pub fn rolled_back(reason: impl Into<String>) -> Self {
        Outcome::RolledBack { reason: reason.into() }
    }
}

/// Journal coordinator. Holds one logical lock per target path so
/// concurrent surgeries on the same file conflict instead of interleaving;
/// different files proceed in parallel.
#[derive(Default)]
pub struct Journal {
    locks: DashMap<PathBuf, ()>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `new_content` to `target` under the journal protocol.
    /// Validation failures surface as [`Error::SyntaxInvalid`] with the
    /// target untouched; I/O failures roll back and propagate.
    pub fn apply(&self, ctx: &Ctx, target: &Path, new_content: &str) -> Result<Outcome> {
        let _guard = self.acquire(target)?;
        ctx.telemetry.incr("surgery.attempts", 1);

        if new_content.trim().is_empty() {
            ctx.telemetry.incr("surgery.rejected", 1);
            return Err(Error::SyntaxInvalid("empty payload".into()));
        }

        // Pre-flight: memory-only check on the proposed bytes. Failure
        // short-circuits without touching the file.
        let language = parser::language_of_path(&target.to_string_lossy());
        if !parser::validate(new_content, &language) {
            ctx.telemetry.incr("surgery.rejected", 1);
            return Err(Error::SyntaxInvalid(format!(
                "proposed content for {} failed validation",
                target.display()
            )));
        }

        let journal_path = journal_path_for(target);
        let existed = target.exists();

        // BACKED_UP — an absent target legitimizes new-file creation.
        if existed {
            std::fs::copy(target, &journal_path)?;
        }

        // WRITTEN
        if let Err(e) = std::fs::write(target, new_content.as_bytes()) {
            self.rollback(target, &journal_path, existed)?;
            return Err(e.into());
        }

        // VALIDATED — re-read what actually landed on disk. The journal
        // exists precisely to survive a crash inside this window.
        let on_disk = match std::fs::read_to_string(target) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.rollback(target, &journal_path, existed)?;
                return Err(e.into());
            }
        };
        if on_disk != new_content || !parser::validate(&on_disk, &language) {
            self.rollback(target, &journal_path, existed)?;
            ctx.telemetry.incr("surgery.rejected", 1);
            return Err(Error::SyntaxInvalid(format!(
                "{} failed validation after write; rolled back",
                target.display()
            )));
        }

        // COMMITTED
        if existed {
            std::fs::remove_file(&journal_path)?;
        }
        ctx.telemetry.incr("surgery.committed", 1);
        Ok(Outcome::Committed)
    }

    /// Restore the pre-mutation bytes and drop the sidecar. For a surgery
    /// that was creating a new file, rollback removes the partial file.
    fn rollback(&self, target: &Path, journal_path: &Path, existed: bool) -> Result<()> {
        if existed {
            std::fs::copy(journal_path, target)?;
            std::fs::remove_file(journal_path)?;
        } else if target.exists() {
            std::fs::remove_file(target)?;
        }
        Ok(())
    }

    /// Roll back every lingering `*.journal` sidecar under `dir`.
    /// Returns the targets that were restored.
    pub fn recover_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut restored = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("journal") {
                    continue;
                }
                let target = path.with_extension("");
                warn!(target = %target.display(), "found stale journal, rolling back");
                std::fs::copy(&path, &target)?;
                std::fs::remove_file(&path)?;
                restored.push(target);
            }
        }
        if !restored.is_empty() {
            info!(count = restored.len(), "crash recovery restored targets");
        }
        Ok(restored)
    }

    fn acquire(&self, target: &Path) -> Result<PathLock<'_>> {
        match self.locks.entry(target.to_path_buf()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Conflict(target.to_path_buf())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(PathLock { locks: &self.locks, path: target.to_path_buf() })
            }
        }
    }
}

/// Sidecar path: `<target>.journal` appended to the full file name.
fn journal_path_for(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".journal");
    PathBuf::from(name)
}

struct PathLock<'a> {
    locks: &'a DashMap<PathBuf, ()>,
    path: PathBuf,
}

impl Drop for PathLock<'_> {
    fn drop(&mut self) {
        self.locks.remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Journal, Ctx) {
        (tempfile::TempDir::new().unwrap(), Journal::new(), Ctx::new())
    }

    #[test]
    fn valid_edit_commits_and_cleans_up() {
        let (tmp, journal, ctx) = setup();
        let target = tmp.path().join("x.py");
        std::fs::write(&target, "def old():\n    return 1\n").unwrap();

        let outcome =
            journal.apply(&ctx, &target, "def new():\n    return 2\n").unwrap();
        assert_eq!(outcome, Outcome::Committed);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "def new():\n    return 2\n"
        );
        assert!(!journal_path_for(&target).exists());
    }

    #[test]
    fn syntax_error_leaves_target_untouched() {
        let (tmp, journal, ctx) = setup();
        let target = tmp.path().join("x.py");
        std::fs::write(&target, "def keep():\n    return 1\n").unwrap();

        let err = journal.apply(&ctx, &target, "def ").unwrap_err();
        assert!(matches!(err, Error::SyntaxInvalid(_)));
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "def keep():\n    return 1\n"
        );
        assert!(!journal_path_for(&target).exists());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let (tmp, journal, ctx) = setup();
        let target = tmp.path().join("x.py");
        std::fs::write(&target, "def keep():\n    return 1\n").unwrap();

        let err = journal.apply(&ctx, &target, "   \n").unwrap_err();
        assert!(matches!(err, Error::SyntaxInvalid(_)));
        assert!(target.exists());
    }

    #[test]
    fn new_file_creation_is_legitimate() {
        let (tmp, journal, ctx) = setup();
        let target = tmp.path().join("fresh.py");

        let outcome =
            journal.apply(&ctx, &target, "def fresh():\n    return 0\n").unwrap();
        assert_eq!(outcome, Outcome::Committed);
        assert!(target.exists());
        assert!(!journal_path_for(&target).exists());
    }

    #[test]
    fn unknown_language_skips_the_syntax_gate() {
        let (tmp, journal, ctx) = setup();
        let target = tmp.path().join("notes.txt");
        std::fs::write(&target, "original notes here\n").unwrap();

        let outcome = journal.apply(&ctx, &target, "{{{ not balanced at all").unwrap();
        assert_eq!(outcome, Outcome::Committed);
    }

    #[test]
    fn stale_journal_rolls_back_on_recovery() {
        let (tmp, journal, _ctx) = setup();
        let target = tmp.path().join("x.py");
        let sidecar = journal_path_for(&target);
        // Simulate a crash between WRITTEN and COMMITTED.
        std::fs::write(&target, "def half_written(").unwrap();
        std::fs::write(&sidecar, "def original():\n    return 1\n").unwrap();

        let restored = journal.recover_dir(tmp.path()).unwrap();
        assert_eq!(restored, vec![target.clone()]);
        assert_eq!(
            std::fs::read_to_string(&target).unwrap(),
            "def original():\n    return 1\n"
        );
        assert!(!sidecar.exists());
    }

    #[test]
    fn concurrent_surgery_on_same_path_conflicts() {
        let (tmp, journal, _ctx) = setup();
        let target = tmp.path().join("x.py");
        let _held = journal.acquire(&target).unwrap();
        assert!(matches!(journal.acquire(&target), Err(Error::Conflict(_))));
    }
}

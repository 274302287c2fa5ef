//! Whole-database snapshot export/import.
//!
//! The engine seals exported bytes with its envelope key for routine
//! persistence; backup restore feeds downloaded bytes back through the
//! import path. `VACUUM INTO` guarantees a consistent single-file copy
//! even with WAL active.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Export the entire database as SQLite file bytes.
    pub fn export_snapshot_bytes(&self) -> Result<Vec<u8>> {
        let scratch = scratch_path("export");

        self.conn().execute(
            "VACUUM INTO ?1",
            params![scratch.to_string_lossy().as_ref()],
        )?;

        let bytes = std::fs::read(&scratch);
        let _ = std::fs::remove_file(&scratch);

        Ok(bytes?)
    }

    /// Replace the live database content with a previously exported
    /// snapshot.
    pub fn import_snapshot_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let scratch = scratch_path("import");
        std::fs::write(&scratch, bytes)?;

        let result = self.import_snapshot_file(&scratch);
        let _ = std::fs::remove_file(&scratch);
        result
    }

    /// Replace the live database content with the database at `path`.
    pub fn import_snapshot_file(&mut self, path: &Path) -> Result<()> {
        let source = Connection::open(path)?;

        let backup = rusqlite::backup::Backup::new(&source, self.conn_mut())?;
        backup.run_to_completion(64, Duration::from_millis(5), None)?;

        tracing::info!(source = %path.display(), "imported database snapshot");
        Ok(())
    }
}

fn scratch_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("gardien-{label}-{}.db", Uuid::new_v4()))
}

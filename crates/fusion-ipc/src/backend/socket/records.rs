//! File-backed record store
//!
//! Records live at `records/<kind>/<hex(name)>`. Writers replace a record by
//! renaming a fully written temporary file over it, so readers never observe
//! a partial record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

static NEXT_TEMP: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(world_dir: &Path) -> Self {
        Self {
            root: world_dir.join("records"),
        }
    }

    fn path(&self, kind: &str, name: &str) -> PathBuf {
        self.root.join(kind).join(hex::encode(name.as_bytes()))
    }

    pub fn get(&self, kind: &str, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(kind, name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, kind: &str, name: &str, data: &[u8]) -> Result<()> {
        let dir = self.root.join(kind);
        fs::create_dir_all(&dir)?;

        let temp = dir.join(format!(
            ".tmp.{}.{}",
            std::process::id(),
            NEXT_TEMP.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp, data)?;
        if let Err(e) = fs::rename(&temp, self.path(kind, name)) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn remove(&self, kind: &str, name: &str) -> Result<bool> {
        match fs::remove_file(self.path(kind, name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self, kind: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.root.join(kind)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('.') {
                continue;
            }
            if let Some(name) = hex::decode(file_name)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
            {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

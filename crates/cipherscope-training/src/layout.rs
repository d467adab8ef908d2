use crate::error::TrainingResult;
use crate::registry::ModelId;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filesystem layout for persisted models inside a data directory.
///
/// Default layout is `<data_dir>/models/<model_id>.json` plus `active.json`.
#[derive(Debug, Clone)]
pub struct RegistryLayout {
    root: PathBuf,
}

impl RegistryLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("models"))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn model_path(&self, id: &ModelId) -> PathBuf {
        self.root.join(format!("{}.json", id.0))
    }

    #[must_use]
    pub fn active_pointer_path(&self) -> PathBuf {
        self.root.join("active.json")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Model files currently on disk, in name order.
    pub fn model_files(&self) -> TrainingResult<Vec<PathBuf>> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let active = self.active_pointer_path();
        let mut out = Vec::new();
        for entry in dir {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") && path != active {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Serialize `value` to `path` through a sibling temp file and a rename, so a
/// reader sees either the old or the new content.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = RegistryLayout::for_data_dir(temp.path());
        let id = ModelId("model-1".to_string());

        assert!(layout.root().ends_with("models"));
        assert!(layout.model_path(&id).to_string_lossy().ends_with("model-1.json"));
    }

    #[test]
    fn test_model_files_skips_active_pointer() {
        let temp = TempDir::new().unwrap();
        let layout = RegistryLayout::for_data_dir(temp.path());
        layout.ensure_dirs().unwrap();

        write_json_atomic(&layout.model_path(&ModelId("b".to_string())), &1).unwrap();
        write_json_atomic(&layout.model_path(&ModelId("a".to_string())), &2).unwrap();
        write_json_atomic(&layout.active_pointer_path(), &"a").unwrap();

        let files = layout.model_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.json"));
    }

    #[test]
    fn test_missing_root_lists_nothing() {
        let temp = TempDir::new().unwrap();
        let layout = RegistryLayout::for_data_dir(&temp.path().join("nope"));
        assert!(layout.model_files().unwrap().is_empty());
    }
}

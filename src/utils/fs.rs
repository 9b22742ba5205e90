//! Small filesystem helpers shared by the manifest and store files.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SiftError;

/// Serialize to a sibling temp file, fsync, then rename into place.
/// Readers either see the old contents or the new, never a torn write.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SiftError> {
    let tmp = path.with_extension("tmp");
    let contents = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, &contents)?;
    let file = std::fs::File::open(&tmp)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SiftError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_atomic_write_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let value = BTreeMap::from([("a".to_string(), 1u32)]);
        atomic_write_json(&path, &value).unwrap();
        let back: BTreeMap<String, u32> = read_json(&path).unwrap();
        assert_eq!(back, value);
        assert!(!path.with_extension("tmp").exists());
    }
}

/// Package size table: approximate resident cost of each importable package
use std::collections::HashMap;
use std::path::Path;

use crate::types::{CacheError, Result};

/// Static mapping from package name to approximate size in kilobytes.
///
/// Loaded once at startup and immutable afterwards, so it is shared across
/// threads without locking. Keys are lowercase; lookups are normalized the
/// same way.
#[derive(Debug, Default)]
pub struct SizeTable {
    sizes: HashMap<String, u64>,
}

impl SizeTable {
    /// Parse a `name:size_in_kb` table. Malformed lines fail startup.
    pub fn load(path: &Path) -> Result<SizeTable> {
        let raw = std::fs::read_to_string(path)?;
        let mut sizes = HashMap::new();

        for (num, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (name, size) = line.split_once(':').ok_or_else(|| {
                CacheError::Config(format!(
                    "malformed package size file {:?}: line {} has no ':'",
                    path,
                    num + 1
                ))
            })?;

            let kb: i64 = size.trim().parse().map_err(|_| {
                CacheError::Config(format!(
                    "malformed package size file {:?}: line {} has non-integer size {:?}",
                    path,
                    num + 1,
                    size
                ))
            })?;
            if kb < 0 {
                return Err(CacheError::Config(format!(
                    "malformed package size file {:?}: line {} has negative size",
                    path,
                    num + 1
                )));
            }

            sizes.insert(name.trim().to_lowercase(), kb as u64);
        }

        Ok(SizeTable { sizes })
    }

    /// Like `load`, but a missing file degrades to an empty table instead of
    /// failing startup.
    pub fn load_or_empty(path: &Path) -> Result<SizeTable> {
        if !path.exists() {
            log::warn!("invalid package sizes path {:?}, using 0 for all", path);
            return Ok(SizeTable::default());
        }
        SizeTable::load(path)
    }

    /// Size of one package in kilobytes; unknown packages weigh nothing.
    pub fn size_of(&self, name: &str) -> u64 {
        match self.sizes.get(&name.to_lowercase()) {
            Some(kb) => *kb,
            None => {
                log::warn!("no size recorded for package {:?}, counting 0", name);
                0
            }
        }
    }

    /// Total size of a package set in kilobytes.
    pub fn total(&self, names: &[String]) -> u64 {
        names.iter().map(|name| self.size_of(name)).sum()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_table(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package_sizes.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_and_lookup() {
        let (_dir, path) = write_table("numpy:51200\nFlask:2048\n\nrequests:900\n");
        let table = SizeTable::load(&path).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.size_of("numpy"), 51200);
        // Lookups normalize case both ways.
        assert_eq!(table.size_of("flask"), 2048);
        assert_eq!(table.size_of("FLASK"), 2048);
        assert_eq!(table.size_of("unknown"), 0);
    }

    #[test]
    fn test_total_sums_known_packages() {
        let (_dir, path) = write_table("a:10\nb:20\n");
        let table = SizeTable::load(&path).unwrap();

        let names = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(table.total(&names), 30);
    }

    #[test]
    fn test_malformed_lines_fail() {
        let (_dir, path) = write_table("numpy 51200\n");
        assert!(SizeTable::load(&path).is_err());

        let (_dir, path) = write_table("numpy:lots\n");
        assert!(SizeTable::load(&path).is_err());

        let (_dir, path) = write_table("numpy:-5\n");
        assert!(SizeTable::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let table = SizeTable::load_or_empty(&dir.path().join("nope.txt")).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.size_of("anything"), 0);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// File name of the per-finder tag manifest, looked up in the finder root
pub const MANIFEST_FILE: &str = "tags.json";

/// One manifest record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Display name, matched by name patterns instead of the relative path
    pub name: String,

    /// Capture path relative to the finder root
    pub path: String,

    pub tags: Vec<String>,
}

/// Tags of the captures under one finder root, keyed by relative path
#[derive(Debug, Clone, Default)]
pub struct TagManifest {
    entries: HashMap<PathBuf, TagEntry>,
}

impl TagManifest {
    /// Load `<root>/tags.json`
    pub fn load(root: &Path) -> AppResult<Self> {
        let file = root.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&file).map_err(|e| {
            AppError::StagingError(format!("cannot read {}: {}", file.display(), e))
        })?;
        let entries: Vec<TagEntry> = serde_json::from_str(&text)?;
        Self::from_entries(root, entries)
    }

    /// Validate every entry; a single bad entry rejects the whole manifest
    pub fn from_entries(root: &Path, entries: Vec<TagEntry>) -> AppResult<Self> {
        let mut map = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.into_iter().enumerate() {
            let bad = |why: &str| {
                AppError::StagingError(format!("tag manifest entry #{}: {}", idx, why))
            };
            if entry.name.trim().is_empty() {
                return Err(bad("name is empty"));
            }
            if entry.path.trim().is_empty() {
                return Err(bad("path is empty"));
            }
            let path = Path::new(&entry.path);
            if path.is_absolute() {
                return Err(bad(&format!("path {} must be relative", entry.path)));
            }
            if !root.join(path).exists() {
                return Err(bad(&format!("path {} does not exist", entry.path)));
            }
            if entry.tags.iter().all(|t| t.trim().is_empty()) {
                return Err(bad(&format!("{} has no tags", entry.path)));
            }
            map.insert(normalize(path), entry);
        }
        Ok(Self { entries: map })
    }

    pub fn lookup(&self, relative: &Path) -> Option<&TagEntry> {
        self.entries.get(&normalize(relative))
    }

    /// Every entry with its normalized relative path
    pub fn entries(&self) -> impl Iterator<Item = (&Path, &TagEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_path(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Expand tag expressions into the combinations a capture may satisfy.
///
/// Within one expression, space separated groups are all required and the
/// comma separated tags of a group are alternatives, so `"a,b c"` expands to
/// `{a, c}` and `{b, c}`. The combinations of every expression are pooled.
pub fn expand_tag_expressions(expressions: &[String]) -> Vec<BTreeSet<String>> {
    let mut combos = Vec::new();
    for expr in expressions {
        let groups: Vec<Vec<&str>> = expr
            .split_whitespace()
            .map(|group| group.split(',').filter(|t| !t.is_empty()).collect::<Vec<_>>())
            .filter(|group| !group.is_empty())
            .collect();
        if groups.is_empty() {
            continue;
        }

        let mut partial: Vec<BTreeSet<String>> = vec![BTreeSet::new()];
        for group in &groups {
            partial = partial
                .iter()
                .flat_map(|prefix| {
                    group.iter().map(move |tag| {
                        let mut next = prefix.clone();
                        next.insert((*tag).to_string());
                        next
                    })
                })
                .collect();
        }
        combos.extend(partial);
    }
    combos
}

/// Whether `tags` is a superset of at least one combination
pub fn satisfies_any(tags: &[String], combos: &[BTreeSet<String>]) -> bool {
    let owned: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
    combos
        .iter()
        .any(|combo| combo.iter().all(|tag| owned.contains(tag.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn expands_cartesian_product() {
        let combos = expand_tag_expressions(&["a,b c".to_string(), "d".to_string()]);
        assert_eq!(combos, vec![set(&["a", "c"]), set(&["b", "c"]), set(&["d"])]);
        assert!(expand_tag_expressions(&["   ".to_string()]).is_empty());
    }

    #[test]
    fn superset_matching() {
        let combos = expand_tag_expressions(&["http,dns v4".to_string()]);
        let tags = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(satisfies_any(&tags(&["dns", "v4", "extra"]), &combos));
        assert!(!satisfies_any(&tags(&["dns", "v6"]), &combos));
        assert!(!satisfies_any(&tags(&[]), &combos));
    }

    #[test]
    fn manifest_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("http")).unwrap();
        std::fs::write(dir.path().join("http/a.pcap"), b"").unwrap();

        let entry = |name: &str, path: &str, tags: &[&str]| TagEntry {
            name: name.to_string(),
            path: path.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        };

        let manifest =
            TagManifest::from_entries(dir.path(), vec![entry("a", "./http/a.pcap", &["http"])])
                .unwrap();
        assert_eq!(manifest.lookup(Path::new("http/a.pcap")).unwrap().name, "a");

        for bad in [
            entry("", "http/a.pcap", &["x"]),
            entry("a", "", &["x"]),
            entry("a", "/abs/a.pcap", &["x"]),
            entry("a", "http/missing.pcap", &["x"]),
            entry("a", "http/a.pcap", &[]),
        ] {
            assert!(TagManifest::from_entries(dir.path(), vec![bad]).is_err());
        }
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.pcap"), b"").unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"[{"name": "x", "path": "x.pcap", "tags": ["dns"]}]"#,
        )
        .unwrap();
        assert_eq!(TagManifest::load(dir.path()).unwrap().len(), 1);
        std::fs::write(dir.path().join(MANIFEST_FILE), "{").unwrap();
        assert!(TagManifest::load(dir.path()).is_err());
    }
}

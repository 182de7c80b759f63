//! Knowledge pack model and loader.
//!
//! A pack is a directory under `marvel/packs/<name>/` holding `pack.json`
//! (metadata), `lessons.jsonl` (one lesson per line) and an optional
//! `guardrails.md`. Lessons are validated individually; a malformed line
//! never fails the pack.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use marvel_core::fsio;

pub const DEFAULT_UTILITY_SCORE: f64 = 0.5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppliesTo {
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct References {
    #[serde(default)]
    pub code_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub applies_to: AppliesTo,
    #[serde(default)]
    pub references: References,
    #[serde(default)]
    pub sensitive_paths: Vec<String>,
    #[serde(default)]
    pub excludes_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub title: String,
    pub description: String,
    pub actionable: String,
    pub category: String,
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub utility_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction_count: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_injected: Option<String>,
}

impl Lesson {
    pub fn utility(&self) -> f64 {
        self.utility_score.unwrap_or(DEFAULT_UTILITY_SCORE)
    }
}

#[derive(Debug, Clone)]
pub struct Pack {
    pub meta: PackMetadata,
    pub lessons: Vec<Lesson>,
    pub guardrails: Option<String>,
    pub dir: PathBuf,
    sensitive_globs: Option<GlobSet>,
}

impl Pack {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Build a pack from in-memory metadata (no backing directory).
    pub fn from_meta(meta: PackMetadata, lessons: Vec<Lesson>) -> Self {
        let sensitive_globs = Self::compile_globs(&meta);
        Self {
            meta,
            lessons,
            guardrails: None,
            dir: PathBuf::new(),
            sensitive_globs,
        }
    }

    /// Compile `sensitive_paths` globs once; bad globs are skipped.
    fn compile_globs(meta: &PackMetadata) -> Option<GlobSet> {
        if meta.sensitive_paths.is_empty() {
            return None;
        }
        let mut builder = GlobSetBuilder::new();
        let mut any = false;
        for pattern in &meta.sensitive_paths {
            // `*` stays within one path segment; `**` crosses segments.
            match GlobBuilder::new(pattern).literal_separator(true).build() {
                Ok(glob) => {
                    builder.add(glob);
                    any = true;
                }
                Err(e) => {
                    warn!(pack = %meta.name, pattern = %pattern, error = %e, "skipping bad sensitive glob");
                }
            }
        }
        if !any {
            return None;
        }
        builder.build().ok()
    }

    pub fn matches_sensitive(&self, file_path: &str) -> bool {
        self.sensitive_globs
            .as_ref()
            .is_some_and(|set| set.is_match(file_path))
    }
}

/// Packs loaded once per daemon lifetime; read-only afterward.
#[derive(Debug, Clone, Default)]
pub struct PackStore {
    packs: Vec<Pack>,
}

impl PackStore {
    pub fn load(packs_dir: &Path) -> Self {
        let mut packs = Vec::new();
        let mut seen_names: HashSet<String> = HashSet::new();

        let entries = match fs::read_dir(packs_dir) {
            Ok(entries) => entries,
            Err(_) => return Self { packs },
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Some(pack) = load_pack(&dir) else {
                continue;
            };
            if !seen_names.insert(pack.meta.name.clone()) {
                warn!(pack = %pack.meta.name, "skipping pack with duplicate name");
                continue;
            }
            packs.push(pack);
        }

        packs.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        Self { packs }
    }

    pub fn packs(&self) -> &[Pack] {
        &self.packs
    }

    pub fn get(&self, name: &str) -> Option<&Pack> {
        self.packs.iter().find(|p| p.meta.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.packs.iter().map(|p| p.meta.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

fn load_pack(dir: &Path) -> Option<Pack> {
    let meta: PackMetadata = fsio::read_json(&dir.join("pack.json"))?;

    let dir_name = dir.file_name()?.to_string_lossy().to_string();
    if meta.name != dir_name {
        warn!(
            pack = %meta.name,
            dir = %dir_name,
            "pack name does not match its directory, skipping"
        );
        return None;
    }

    let mut lessons: Vec<Lesson> = fsio::read_jsonl(&dir.join("lessons.jsonl"));
    dedupe_titles(&meta.name, &mut lessons);
    drop_invalid(&meta.name, &mut lessons);

    let guardrails = fs::read_to_string(dir.join("guardrails.md")).ok();
    let sensitive_globs = Pack::compile_globs(&meta);

    Some(Pack {
        meta,
        lessons,
        guardrails,
        dir: dir.to_path_buf(),
        sensitive_globs,
    })
}

/// Titles are the dedup key; the first occurrence wins.
fn dedupe_titles(pack: &str, lessons: &mut Vec<Lesson>) {
    let mut seen: HashSet<String> = HashSet::new();
    lessons.retain(|lesson| {
        if seen.insert(lesson.title.clone()) {
            true
        } else {
            warn!(pack, title = %lesson.title, "dropping lesson with duplicate title");
            false
        }
    });
}

fn drop_invalid(pack: &str, lessons: &mut Vec<Lesson>) {
    lessons.retain(|lesson| {
        let valid = !lesson.title.trim().is_empty()
            && !lesson.actionable.trim().is_empty()
            && lesson
                .utility_score
                .map_or(true, |score| (0.0..=1.0).contains(&score));
        if !valid {
            warn!(pack, title = %lesson.title, "dropping invalid lesson");
        }
        valid
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    pub(crate) fn write_pack(root: &Path, name: &str, meta: serde_json::Value, lessons: &[serde_json::Value]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("pack.json"), meta.to_string()).unwrap();
        let mut file = fs::File::create(dir.join("lessons.jsonl")).unwrap();
        for lesson in lessons {
            writeln!(file, "{lesson}").unwrap();
        }
    }

    fn lesson(title: &str) -> serde_json::Value {
        serde_json::json!({
            "title": title,
            "description": "d",
            "actionable": "do the thing",
            "category": "testing",
            "timestamp": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn loads_packs_and_skips_mismatched_names() {
        let dir = tempdir().unwrap();
        write_pack(
            dir.path(),
            "api-conventions",
            serde_json::json!({"name": "api-conventions", "version": "1.0"}),
            &[lesson("Use plural route names")],
        );
        write_pack(
            dir.path(),
            "wrong-dir",
            serde_json::json!({"name": "other-name", "version": "1.0"}),
            &[],
        );

        let store = PackStore::load(dir.path());
        assert_eq!(store.names(), vec!["api-conventions"]);
        assert_eq!(store.get("api-conventions").unwrap().lessons.len(), 1);
    }

    #[test]
    fn malformed_lessons_are_skipped_individually() {
        let dir = tempdir().unwrap();
        let pack_dir = dir.path().join("p");
        fs::create_dir_all(&pack_dir).unwrap();
        fs::write(
            pack_dir.join("pack.json"),
            serde_json::json!({"name": "p", "version": "1"}).to_string(),
        )
        .unwrap();
        fs::write(
            pack_dir.join("lessons.jsonl"),
            format!("{}\nnot json at all\n{}\n", lesson("first"), lesson("second")),
        )
        .unwrap();

        let store = PackStore::load(dir.path());
        assert_eq!(store.get("p").unwrap().lessons.len(), 2);
    }

    #[test]
    fn duplicate_titles_keep_first() {
        let dir = tempdir().unwrap();
        write_pack(
            dir.path(),
            "p",
            serde_json::json!({"name": "p", "version": "1"}),
            &[lesson("same"), lesson("same"), lesson("other")],
        );
        let store = PackStore::load(dir.path());
        assert_eq!(store.get("p").unwrap().lessons.len(), 2);
    }

    #[test]
    fn out_of_range_utility_is_dropped() {
        let dir = tempdir().unwrap();
        let mut bad = lesson("bad");
        bad["utility_score"] = serde_json::json!(1.5);
        write_pack(
            dir.path(),
            "p",
            serde_json::json!({"name": "p", "version": "1"}),
            &[bad, lesson("good")],
        );
        let store = PackStore::load(dir.path());
        let lessons = &store.get("p").unwrap().lessons;
        assert_eq!(lessons.len(), 1);
        assert_eq!(lessons[0].title, "good");
    }

    #[test]
    fn sensitive_globs_match_across_segments() {
        let dir = tempdir().unwrap();
        write_pack(
            dir.path(),
            "sec",
            serde_json::json!({
                "name": "sec",
                "version": "1",
                "sensitive_paths": ["src/auth/**", "*.env"]
            }),
            &[],
        );
        let store = PackStore::load(dir.path());
        let pack = store.get("sec").unwrap();
        assert!(pack.matches_sensitive("src/auth/token/refresh.ts"));
        assert!(pack.matches_sensitive("prod.env"));
        assert!(!pack.matches_sensitive("src/ui/button.tsx"));
    }

    #[test]
    fn missing_packs_dir_is_empty_store() {
        let dir = tempdir().unwrap();
        let store = PackStore::load(&dir.path().join("nope"));
        assert!(store.is_empty());
    }
}

//! Relevance scoring: which packs apply to a file.
//!
//! Weighted signals accumulate into a score per pack; excluded paths
//! zero the pack out regardless. Packs with a strong signal (code path,
//! sensitive path, recent correction) clear a lower bar than packs that
//! matched by extension alone.

use chrono::{DateTime, Duration, Utc};

use crate::pack::Pack;

pub const WEIGHT_EXTENSION: u32 = 5;
pub const WEIGHT_CODE_PATH: u32 = 15;
pub const WEIGHT_SENSITIVE_PATH: u32 = 20;
pub const WEIGHT_RECENT_CORRECTION: u32 = 20;
pub const WEIGHT_CATEGORY_ALIGNMENT: u32 = 8;
pub const WEIGHT_PATH_KEYWORD: u32 = 8;

pub const STRONG_THRESHOLD: u32 = 10;
pub const WEAK_THRESHOLD: u32 = 20;
pub const MAX_SELECTED: usize = 4;
pub const MAX_CORRECTION_BOOSTS: u32 = 3;

const RECENT_WINDOW_MINUTES: i64 = 30;

/// File-path keywords mapped to the pack category they indicate.
const KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    ("test", "testing"),
    ("spec", "testing"),
    ("auth", "security"),
    ("middleware", "api"),
    ("config", "configuration"),
    ("env", "configuration"),
    ("schema", "database"),
    ("migration", "database"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidanceKind {
    Correction,
    Direction,
}

/// Minimal view of a stored guidance entry used for scoring.
#[derive(Debug, Clone)]
pub struct GuidanceSignal {
    pub kind: GuidanceKind,
    pub category: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackScore {
    pub pack: String,
    pub score: u32,
    pub strong: bool,
}

/// The lowercased final dotted suffix of the file name.
fn file_extension(file_path: &str) -> Option<String> {
    let name = file_path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

pub fn score_pack(
    pack: &Pack,
    file_path: &str,
    recent_guidance: &[GuidanceSignal],
    now: DateTime<Utc>,
) -> PackScore {
    // Exclusion takes precedence over every positive signal.
    if pack
        .meta
        .excludes_paths
        .iter()
        .any(|prefix| file_path.contains(prefix.as_str()))
    {
        return PackScore {
            pack: pack.name().to_string(),
            score: 0,
            strong: false,
        };
    }

    let window = Duration::minutes(RECENT_WINDOW_MINUTES);
    let recent: Vec<&GuidanceSignal> = recent_guidance
        .iter()
        .filter(|g| now - g.timestamp <= window)
        .collect();

    let mut score = 0u32;
    let mut strong = false;

    if let Some(ext) = file_extension(file_path) {
        if pack
            .meta
            .applies_to
            .extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        {
            score += WEIGHT_EXTENSION;
        }
    }

    if pack
        .meta
        .references
        .code_paths
        .iter()
        .any(|p| file_path.contains(p.as_str()))
    {
        score += WEIGHT_CODE_PATH;
        strong = true;
    }

    if pack.matches_sensitive(file_path) {
        score += WEIGHT_SENSITIVE_PATH;
        strong = true;
    }

    let corrections = recent
        .iter()
        .filter(|g| {
            g.kind == GuidanceKind::Correction
                && g.category
                    .as_ref()
                    .is_some_and(|c| pack.meta.categories.contains(c))
        })
        .count() as u32;
    if corrections > 0 {
        score += WEIGHT_RECENT_CORRECTION * corrections.min(MAX_CORRECTION_BOOSTS);
        strong = true;
    }

    if recent.iter().any(|g| {
        g.category
            .as_ref()
            .is_some_and(|c| pack.meta.categories.contains(c))
    }) {
        score += WEIGHT_CATEGORY_ALIGNMENT;
    }

    let path_lower = file_path.to_lowercase();
    if KEYWORD_CATEGORIES.iter().any(|(keyword, category)| {
        path_lower.contains(keyword) && pack.meta.categories.iter().any(|c| c == category)
    }) {
        score += WEIGHT_PATH_KEYWORD;
    }

    PackScore {
        pack: pack.name().to_string(),
        score,
        strong,
    }
}

/// Score every pack and pick the top four above their threshold.
pub fn select_packs<'a>(
    packs: &'a [Pack],
    file_path: &str,
    recent_guidance: &[GuidanceSignal],
    now: DateTime<Utc>,
) -> Vec<(&'a Pack, PackScore)> {
    let mut scored: Vec<(&Pack, PackScore)> = packs
        .iter()
        .map(|pack| (pack, score_pack(pack, file_path, recent_guidance, now)))
        .filter(|(_, s)| {
            let threshold = if s.strong { STRONG_THRESHOLD } else { WEAK_THRESHOLD };
            s.score >= threshold
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.score
            .cmp(&a.1.score)
            .then_with(|| a.0.name().cmp(b.0.name()))
    });
    scored.truncate(MAX_SELECTED);
    scored
}

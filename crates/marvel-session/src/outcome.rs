//! Outcome correlation: did injected guidance actually help?
//!
//! At session end, each injection is paired with subsequent corrections
//! (weight 1.0) or tool failures on the injected file (weight 0.5, only
//! when no correction already applies). Lesson utility scores are then
//! updated with a decay-weighted mean, so stale history cannot dominate
//! fresh sessions.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use marvel_core::fsio;
use marvel_packs::pack::{Lesson, Pack};

use crate::guidance::{Guidance, GuidanceType};
use crate::run_state::{InjectionRecord, ToolCallRecord};

const DECAY_DAYS: f64 = 90.0;
const MIN_EXISTING_WEIGHT: f64 = 0.5;
const CORRECTION_WEIGHT: f64 = 1.0;
const FAILURE_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonOutcome {
    pub pack: String,
    pub lesson: String,
    pub injected: u32,
    pub followed_by_correction: f64,
}

fn pack_categories<'a>(packs: &'a [Pack], names: &[String]) -> Vec<&'a str> {
    packs
        .iter()
        .filter(|p| names.iter().any(|n| n == p.name()))
        .flat_map(|p| p.meta.categories.iter().map(String::as_str))
        .collect()
}

/// Pair injections with subsequent corrections and failures.
pub fn correlate_outcomes(
    injections: &[InjectionRecord],
    guidance: &[Guidance],
    tool_calls: &[ToolCallRecord],
    packs: &[Pack],
) -> Vec<LessonOutcome> {
    let mut outcomes: HashMap<(String, String), LessonOutcome> = HashMap::new();

    for injection in injections {
        let categories = pack_categories(packs, &injection.packs_injected);

        let corrected = guidance.iter().any(|g| {
            g.guidance_type == GuidanceType::Correction
                && g.timestamp >= injection.timestamp
                && (g.preceding_file.as_deref() == Some(injection.file.as_str())
                    || g.category
                        .as_deref()
                        .is_some_and(|c| categories.contains(&c)))
        });

        // Tool failures only count when no explicit correction applies
        // to the same injection.
        let failed = !corrected
            && tool_calls.iter().any(|t| {
                !t.success
                    && t.timestamp >= injection.timestamp
                    && t.input_summary.contains(injection.file.as_str())
            });

        let weight = if corrected {
            CORRECTION_WEIGHT
        } else if failed {
            FAILURE_WEIGHT
        } else {
            0.0
        };

        for lesson in &injection.lessons_injected {
            let pack = owning_pack(packs, &injection.packs_injected, lesson);
            let entry = outcomes
                .entry((pack.clone(), lesson.clone()))
                .or_insert_with(|| LessonOutcome {
                    pack,
                    lesson: lesson.clone(),
                    injected: 0,
                    followed_by_correction: 0.0,
                });
            entry.injected += 1;
            entry.followed_by_correction += weight;
        }
    }

    let mut out: Vec<LessonOutcome> = outcomes.into_values().collect();
    out.sort_by(|a, b| (a.pack.clone(), a.lesson.clone()).cmp(&(b.pack.clone(), b.lesson.clone())));
    out
}

/// Attribute a lesson title to the injected pack that owns it; titles
/// are unique within a pack, so the first owner wins.
fn owning_pack(packs: &[Pack], injected_packs: &[String], title: &str) -> String {
    injected_packs
        .iter()
        .find(|name| {
            packs
                .iter()
                .find(|p| p.name() == name.as_str())
                .is_some_and(|p| p.lessons.iter().any(|l| l.title == title))
        })
        .or_else(|| injected_packs.first())
        .cloned()
        .unwrap_or_default()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Decay-weighted utility update for one lesson.
fn updated_utility(lesson: &Lesson, outcome: &LessonOutcome, now: DateTime<Utc>) -> f64 {
    let session_utility = (1.0
        - outcome.followed_by_correction / f64::from(outcome.injected.max(1)))
    .clamp(0.0, 1.0);

    let existing_utility = lesson.utility();
    let existing_injections = f64::from(lesson.injection_count.unwrap_or(0));

    let days_since_last = lesson
        .last_injected
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| (now - t.with_timezone(&Utc)).num_days() as f64)
        .unwrap_or(0.0);
    let existing_weight = (1.0 - days_since_last / DECAY_DAYS).max(MIN_EXISTING_WEIGHT);

    let session_injections = f64::from(outcome.injected);
    let existing_mass = existing_weight * existing_injections;
    let denominator = existing_mass + session_injections;
    if denominator <= 0.0 {
        return round3(session_utility);
    }
    let blended =
        (existing_utility * existing_mass + session_utility * session_injections) / denominator;
    round3(blended.clamp(0.0, 1.0))
}

/// Apply outcomes to each pack's `lessons.jsonl`, rewriting atomically.
pub fn apply_outcomes(packs: &[Pack], outcomes: &[LessonOutcome], now: DateTime<Utc>) {
    let by_pack: HashMap<&str, Vec<&LessonOutcome>> =
        outcomes.iter().fold(HashMap::new(), |mut acc, outcome| {
            acc.entry(outcome.pack.as_str()).or_default().push(outcome);
            acc
        });

    for pack in packs {
        let Some(pack_outcomes) = by_pack.get(pack.name()) else {
            continue;
        };
        let lessons_path = pack.dir.join("lessons.jsonl");
        let mut lessons: Vec<Lesson> = fsio::read_jsonl(&lessons_path);
        if lessons.is_empty() {
            continue;
        }

        let mut touched = false;
        for lesson in &mut lessons {
            let Some(outcome) = pack_outcomes.iter().find(|o| o.lesson == lesson.title) else {
                continue;
            };
            let new_utility = updated_utility(lesson, outcome, now);
            lesson.utility_score = Some(new_utility);
            lesson.injection_count =
                Some(lesson.injection_count.unwrap_or(0) + outcome.injected);
            lesson.correction_count = Some(
                lesson.correction_count.unwrap_or(0.0) + outcome.followed_by_correction,
            );
            lesson.last_injected = Some(now.to_rfc3339());
            touched = true;
        }
        if !touched {
            continue;
        }

        let mut content = String::new();
        for lesson in &lessons {
            match serde_json::to_string(lesson) {
                Ok(line) => {
                    content.push_str(&line);
                    content.push('\n');
                }
                Err(e) => warn!(pack = %pack.name(), error = %e, "failed to serialize lesson"),
            }
        }
        if let Err(e) = fsio::atomic_write(&lessons_path, content.as_bytes(), None) {
            warn!(pack = %pack.name(), error = %e, "failed to rewrite lessons file");
        }
    }
}

/// Append the session's outcomes to the run directory, one per line.
pub fn journal_outcomes(run_dir: &Path, outcomes: &[LessonOutcome]) {
    for outcome in outcomes {
        fsio::append_jsonl_best_effort(&run_dir.join("lesson-outcomes.jsonl"), outcome);
    }
}

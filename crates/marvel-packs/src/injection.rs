//! Injection formatting: the guidance text returned on pre-edit hooks.
//!
//! Only fresh lessons are injected: a `(pack, title)` pair that was
//! already injected during this daemon lifetime is suppressed. The dedup
//! set is bounded and cleared on compaction and on session start.

use std::collections::HashSet;
use std::collections::VecDeque;

use crate::pack::Pack;
use crate::relevance::PackScore;

pub const MAX_LESSONS_PER_PACK: usize = 3;
pub const MAX_LESSONS_TOTAL: usize = 10;
pub const DEDUP_CAPACITY: usize = 200;

/// LRU-bounded set of already-injected `(pack, lesson title)` pairs.
#[derive(Debug, Default)]
pub struct InjectionDedup {
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
}

impl InjectionDedup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pack: &str, title: &str) -> bool {
        self.seen
            .contains(&(pack.to_string(), title.to_string()))
    }

    pub fn insert(&mut self, pack: &str, title: &str) {
        let key = (pack.to_string(), title.to_string());
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > DEDUP_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    /// Cleared on compaction and on session-start, independently.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// One lesson that made it into the injected block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedLesson {
    pub pack: String,
    pub title: String,
}

/// What an injection produced, for the append-only injection record.
#[derive(Debug, Clone)]
pub struct InjectionOutcome {
    pub text: String,
    pub lessons: Vec<InjectedLesson>,
    pub packs: Vec<String>,
}

pub struct Injector;

impl Injector {
    /// Format up to three fresh lessons per pack, ten total, highest
    /// utility first. Returns `None` when nothing fresh remains.
    pub fn format(
        selected: &[(&Pack, PackScore)],
        file_path: &str,
        dedup: &mut InjectionDedup,
    ) -> Option<InjectionOutcome> {
        let mut lessons: Vec<InjectedLesson> = Vec::new();
        let mut packs: Vec<String> = Vec::new();
        let mut body = String::new();

        for (pack, _score) in selected {
            let mut ranked: Vec<_> = pack.lessons.iter().collect();
            ranked.sort_by(|a, b| {
                b.utility()
                    .partial_cmp(&a.utility())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut pack_lines = String::new();
            let mut pack_count = 0usize;
            for lesson in ranked {
                if lessons.len() >= MAX_LESSONS_TOTAL || pack_count >= MAX_LESSONS_PER_PACK {
                    break;
                }
                if dedup.contains(pack.name(), &lesson.title) {
                    continue;
                }
                dedup.insert(pack.name(), &lesson.title);
                pack_lines.push_str(&format!("- {}: {}\n", lesson.title, lesson.actionable));
                lessons.push(InjectedLesson {
                    pack: pack.name().to_string(),
                    title: lesson.title.clone(),
                });
                pack_count += 1;
            }

            if pack_count > 0 {
                body.push_str(&format!("\n[{}]\n{}", pack.name(), pack_lines));
                packs.push(pack.name().to_string());
            }
        }

        if lessons.is_empty() {
            return None;
        }

        let text = format!("Project guidance for {file_path}:\n{body}");
        Some(InjectionOutcome {
            text,
            lessons,
            packs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{Lesson, PackMetadata};
    use crate::relevance::PackScore;

    fn lesson(title: &str, utility: Option<f64>) -> Lesson {
        Lesson {
            title: title.to_string(),
            description: "d".to_string(),
            actionable: format!("{title} actionable"),
            category: "testing".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            utility_score: utility,
            injection_count: None,
            correction_count: None,
            last_injected: None,
        }
    }

    fn pack(name: &str, lessons: Vec<Lesson>) -> Pack {
        Pack::from_meta(
            PackMetadata {
                name: name.to_string(),
                version: "1".to_string(),
                categories: Vec::new(),
                applies_to: Default::default(),
                references: Default::default(),
                sensitive_paths: Vec::new(),
                excludes_paths: Vec::new(),
            },
            lessons,
        )
    }

    fn score(name: &str) -> PackScore {
        PackScore {
            pack: name.to_string(),
            score: 20,
            strong: true,
        }
    }

    #[test]
    fn formats_bullets_per_pack() {
        let p = pack("api", vec![lesson("Use plural routes", None)]);
        let mut dedup = InjectionDedup::new();
        let outcome = Injector::format(&[(&p, score("api"))], "src/routes.ts", &mut dedup).unwrap();

        assert!(outcome.text.contains("Project guidance for src/routes.ts:"));
        assert!(outcome.text.contains("[api]"));
        assert!(outcome
            .text
            .contains("- Use plural routes: Use plural routes actionable"));
        assert_eq!(outcome.packs, vec!["api"]);
    }

    #[test]
    fn utility_orders_and_caps_per_pack() {
        let p = pack(
            "p",
            vec![
                lesson("low", Some(0.1)),
                lesson("high", Some(0.9)),
                lesson("mid", Some(0.5)),
                lesson("default", None),
            ],
        );
        let mut dedup = InjectionDedup::new();
        let outcome = Injector::format(&[(&p, score("p"))], "f.ts", &mut dedup).unwrap();

        assert_eq!(outcome.lessons.len(), MAX_LESSONS_PER_PACK);
        assert_eq!(outcome.lessons[0].title, "high");
        // Default utility 0.5 ties with "mid"; "low" (0.1) is cut.
        assert!(outcome.lessons.iter().all(|l| l.title != "low"));
    }

    #[test]
    fn global_cap_is_ten() {
        let packs: Vec<Pack> = (0..5)
            .map(|i| {
                pack(
                    &format!("p{i}"),
                    (0..3).map(|j| lesson(&format!("l{i}-{j}"), None)).collect(),
                )
            })
            .collect();
        let selected: Vec<(&Pack, PackScore)> =
            packs.iter().map(|p| (p, score(p.name()))).collect();

        let mut dedup = InjectionDedup::new();
        let outcome = Injector::format(&selected, "f.ts", &mut dedup).unwrap();
        assert_eq!(outcome.lessons.len(), MAX_LESSONS_TOTAL);
    }

    #[test]
    fn second_injection_suppresses_seen_lessons() {
        let p = pack("p", vec![lesson("one", None), lesson("two", None)]);
        let mut dedup = InjectionDedup::new();

        let first = Injector::format(&[(&p, score("p"))], "f.ts", &mut dedup).unwrap();
        assert_eq!(first.lessons.len(), 2);

        // Same selection again: everything is deduped now.
        assert!(Injector::format(&[(&p, score("p"))], "f.ts", &mut dedup).is_none());

        dedup.clear();
        let again = Injector::format(&[(&p, score("p"))], "f.ts", &mut dedup).unwrap();
        assert_eq!(again.lessons.len(), 2);
    }

    #[test]
    fn dedup_is_lru_bounded() {
        let mut dedup = InjectionDedup::new();
        for i in 0..(DEDUP_CAPACITY + 10) {
            dedup.insert("p", &format!("lesson-{i}"));
        }
        assert_eq!(dedup.len(), DEDUP_CAPACITY);
        // The oldest entries fell out.
        assert!(!dedup.contains("p", "lesson-0"));
        assert!(dedup.contains("p", &format!("lesson-{}", DEDUP_CAPACITY + 9)));
    }

    #[test]
    fn empty_pack_contributes_no_block() {
        let p1 = pack("empty", vec![]);
        let p2 = pack("full", vec![lesson("a", None)]);
        let mut dedup = InjectionDedup::new();
        let outcome = Injector::format(
            &[(&p1, score("empty")), (&p2, score("full"))],
            "f.ts",
            &mut dedup,
        )
        .unwrap();
        assert!(!outcome.text.contains("[empty]"));
        assert_eq!(outcome.packs, vec!["full"]);
    }
}

pub mod injection;
pub mod pack;
pub mod relevance;

pub use injection::{InjectedLesson, InjectionDedup, InjectionOutcome, Injector};
pub use pack::{Lesson, Pack, PackMetadata, PackStore};
pub use relevance::{select_packs, GuidanceKind, GuidanceSignal, PackScore};

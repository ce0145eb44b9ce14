// src/services/mod.rs

pub mod audit;        // best-effort JSONL audit trail
pub mod beliefs;      // belief store + gated EMA aggregator
pub mod cursor;       // fold watermark
pub mod now;          // per-turn mood + working memory
pub mod observation;  // intake record, vocabulary, extractor seam
pub mod reflection;   // drift engine + trait vector
pub mod state;        // the ONLY SQLite writer
pub mod wal;          // append-only observation log

// Public API
pub use audit::Audit;
pub use beliefs::{Aggregator, BeliefDimension, BeliefKey, BeliefMap, BeliefStore, FoldReport};
pub use cursor::CommitCursor;
pub use now::{DynamicState, NowState, WorkingMemory};
pub use observation::{Extractor, Observation, Ontology, OpenVocabulary, Vocabulary};
pub use reflection::{DriftEngine, ReflectionLogEntry, TraitVector};
pub use state::{Counters, StateStore};
pub use wal::{CompactionReport, ObservationLog};

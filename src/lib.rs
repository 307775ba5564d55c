//! # resonance-core
//!
//! Turn-level state transformation learning for conversational systems.
//!
//! ---
//!
//! Each turn of an exchange is evaluated by a set of independent signal
//! sources ("organs"). The engine iterates them to convergence, encodes how the
//! aggregate state moved into a fixed 57-dimensional fingerprint, and learns
//! from that fingerprint online:
//!
//! **Families**: signatures are clustered into self-discovered behavioural
//! families under a similarity threshold that tightens as the taxonomy grows.
//!
//! **Coupling**: every cycle nudges a symmetric matrix of source-to-source
//! association toward the sources' co-activation.
//!
//! **Patterns**: response fragments are stored under discretised signature
//! neighbourhoods, with a quality learned from the user's delayed feedback and
//! a recency discount that never deletes.
//!
//! ## The pipeline
//!
//! ```text
//! TurnInput → SignalAdapter × N → ConvergenceLoop → SignatureExtractor → FamilyClusterer
//!                                       │                    │
//!                                       ↓                    ↓
//!                               CouplingLearner        PatternLearner ← feedback (turn N+1)
//! ```
//!
//! ## Module overview
//!
//! | Module | Key types | What it does |
//! |--------|-----------|--------------|
//! | [`signal`] | [`SignalSource`], [`SignalAdapter`], [`SignalResult`] | Typed source contract, fault and timeout handling |
//! | [`convergence`] | [`ConvergenceLoop`], [`CycleState`] | Energy descent, satisfaction, kairos, cycle budget |
//! | [`signature`] | [`SignatureExtractor`], [`TransformationSignature`] | Deterministic 57-dim encoding |
//! | [`family`] | [`FamilyClusterer`], [`Family`] | Adaptive-threshold online clustering, collapse diagnostics |
//! | [`coupling`] | [`CouplingLearner`], [`CouplingMatrix`] | Bounded EMA co-activation learning |
//! | [`pattern`] | [`PatternLearner`], [`Retrieval`] | Fuzzy, recency-weighted fragment recall |
//! | [`engine`] | [`Conversation`], [`SharedStores`] | Per-turn orchestration and delayed feedback |
//! | [`persist`] | [`persist::StoreDirectory`], [`persist::StoreWriter`] | Versioned snapshots, locked load-mutate-flush (requires `serde`) |
//! | [`reference`] | [`reference::ScriptedSource`], [`reference::KeywordSource`] | Deterministic reference sources |
//! | [`config`] | [`EngineConfig`] | Aggregate parameters with validation |
//!
//! ## Quick start
//!
//! ```rust
//! use resonance_core::reference::KeywordSource;
//! use resonance_core::{AuxiliarySignals, Conversation, EngineConfig, SharedStores, SignalSource, TurnInput};
//!
//! let sources: Vec<Box<dyn SignalSource>> = vec![
//!     Box::new(KeywordSource::new("warmth", &["thanks", "great"], 0.4, 0.2)),
//!     Box::new(KeywordSource::new("distress", &["alone", "tired"], 0.5, -0.2)),
//! ];
//! let specs: Vec<_> = sources.iter().map(|s| s.spec().clone()).collect();
//! let config = EngineConfig::default();
//! let stores = SharedStores::new(&config, &specs).unwrap();
//! let mut conversation = Conversation::new(config, sources, stores).unwrap();
//!
//! let defaults = vec!["I'm listening.".to_string()];
//! let report = conversation
//!     .process_turn(&TurnInput::new(1, "thanks, that was great"), None, &AuxiliarySignals::default(), &defaults)
//!     .unwrap();
//! let reply = report.retrieval.best().unwrap().fragment.clone();
//! conversation.emit(&reply);
//! ```
//!
//! ## Features
//!
//! - `serde` (default): serialisation of configs and results, and the [`persist`] module.
//! - `python-ffi`: PyO3 bindings for the three learning stores.
//!
//! ## License
//!
//! Business Source License 1.1.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod convergence;
pub mod coupling;
pub mod engine;
pub mod error;
pub mod family;
pub mod pattern;
pub mod reference;
pub mod signal;
pub mod signature;

#[cfg(feature = "serde")]
pub mod persist;

#[cfg(feature = "python-ffi")]
pub mod ffi;

pub use config::EngineConfig;
pub use convergence::{ConvergenceConfig, ConvergenceLoop, ConvergenceOutcome, CycleState, TerminationReason};
pub use coupling::{CoActivation, CouplingConfig, CouplingInit, CouplingLearner, CouplingMatrix};
pub use engine::{Conversation, PendingOutcome, SharedStores, TurnReport};
pub use error::{EngineError, EngineResult};
pub use family::{
    Assignment, AssignmentKind, ClusterConfig, ClusterDiagnostics, CollapsePolicy, Family, FamilyClusterer, FamilyId,
};
pub use pattern::{
    Candidate, MatchKind, PatternConfig, PatternEntry, PatternLearner, PatternState, Retrieval, RetrievalQuery,
    RetrievalSource,
};
pub use signal::{Regime, SignalAdapter, SignalError, SignalResult, SignalSource, SourceSpec, TurnInput};
pub use signature::{
    AuxiliarySignals, SignatureExtractor, SignatureLayout, TransformationSignature, LAYOUT_VERSION, SIGNATURE_DIM,
};

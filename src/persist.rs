//! Versioned on-disk snapshots of the three learning stores.
//!
//! # Layout
//!
//! ```text
//! <dir>/families.json   FamilySnapshot   centroids, counts, outcome means
//! <dir>/coupling.json   CouplingSnapshot source names + row-major matrix
//! <dir>/patterns.json   PatternSnapshot  discretised buckets + entries
//! <dir>/.writer.lock    owner pid while a WriterLock is held
//! ```
//!
//! Every artifact starts with a [`StoreHeader`]. On load the header is parsed
//! on its own and checked against the running encoder before any payload is
//! read; a different artifact name, format version or layout tag fails with
//! [`EngineError::SchemaMismatch`].
//!
//! # Single writer
//!
//! Writing is a load-mutate-flush cycle held under one [`WriterLock`]:
//! [`StoreDirectory::open_writer`] acquires the lock first and only then loads,
//! and the returned [`StoreWriter`] is the only way to flush. A second writer
//! fails with [`EngineError::StoreLocked`] until the first is dropped, so it
//! always loads what the first one flushed.
//!
//! ```text
//! let writer = dir.open_writer(&config, &sources)?;   // lock, then load
//! ... conversations on writer.stores().clone() ...
//! writer.flush()?;                                    // still locked
//! drop(writer);                                       // lock released
//! ```
//!
//! Observers use [`StoreDirectory::load_all`] without a lock. Writes go to a
//! temporary file that is renamed over the target, so readers never see a
//! partial artifact.
//!
//! The lock file holds the owner's pid, reported in `StoreLocked`. A lock
//! left behind by a crashed process must be removed by hand.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use heapless::Deque;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::coupling::{CouplingConfig, CouplingLearner, CouplingMatrix};
use crate::engine::SharedStores;
use crate::error::{EngineError, EngineResult};
use crate::family::{ClusterConfig, Family, FamilyClusterer, FamilyId, MAX_TRACKED_MEMBERS};
use crate::pattern::{PatternBucket, PatternConfig, PatternEntry, PatternLearner};
use crate::signal::SourceSpec;
use crate::signature::{SignatureLayout, SIGNATURE_DIM};

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// File name of the family artifact.
pub const FAMILIES_FILE: &str = "families.json";
/// File name of the coupling artifact.
pub const COUPLING_FILE: &str = "coupling.json";
/// File name of the pattern artifact.
pub const PATTERNS_FILE: &str = "patterns.json";
/// File name of the writer lock.
pub const LOCK_FILE: &str = ".writer.lock";

// ─── Header ─────────────────────────────────────────────────────────────────

/// Identifies an artifact and the encoder that wrote it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoreHeader {
    /// `families`, `coupling` or `patterns`.
    pub artifact: String,
    /// Always [`FORMAT_VERSION`] for newly written artifacts.
    pub format_version: u16,
    /// [`SignatureLayout::tag`] of the writing encoder.
    pub layout_tag: String,
}

impl StoreHeader {
    fn new(artifact: &str, layout_tag: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            format_version: FORMAT_VERSION,
            layout_tag: layout_tag.to_string(),
        }
    }

    /// Fail unless this header matches `artifact` under `layout_tag`.
    pub fn check(&self, artifact: &str, layout_tag: &str) -> EngineResult<()> {
        let mismatch = |expected: String, found: String| EngineError::SchemaMismatch {
            artifact: artifact.to_string(),
            expected,
            found,
        };
        if self.artifact != artifact {
            return Err(mismatch(format!("artifact {artifact}"), format!("artifact {}", self.artifact)));
        }
        if self.format_version != FORMAT_VERSION {
            return Err(mismatch(
                format!("format v{FORMAT_VERSION}"),
                format!("format v{}", self.format_version),
            ));
        }
        if self.layout_tag != layout_tag {
            return Err(mismatch(layout_tag.to_string(), self.layout_tag.clone()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct HeaderOnly {
    header: StoreHeader,
}

// ─── Families ───────────────────────────────────────────────────────────────

/// Serializable form of one [`Family`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FamilyRecord {
    /// Family id.
    pub id: FamilyId,
    /// Display name.
    pub name: String,
    /// Unit-norm centroid, [`SIGNATURE_DIM`] values.
    pub centroid: Vec<f32>,
    /// Members since creation.
    pub member_count: u64,
    /// Outcome observations.
    pub outcome_count: u64,
    /// Running mean outcome.
    pub mean_outcome: f32,
    /// Recent member turn ids, oldest first.
    pub recent_members: Vec<u64>,
    /// Founding turn.
    pub created_turn: u64,
    /// Most recent assignment turn.
    pub last_turn: u64,
}

impl From<&Family> for FamilyRecord {
    fn from(f: &Family) -> Self {
        Self {
            id: f.id,
            name: f.name.clone(),
            centroid: f.centroid.to_vec(),
            member_count: f.member_count,
            outcome_count: f.outcome_count,
            mean_outcome: f.mean_outcome,
            recent_members: f.recent_members.iter().copied().collect(),
            created_turn: f.created_turn,
            last_turn: f.last_turn,
        }
    }
}

impl FamilyRecord {
    /// Rebuild the live family. Fails on a centroid of the wrong length.
    pub fn into_family(self) -> EngineResult<Family> {
        let centroid: [f32; SIGNATURE_DIM] =
            self.centroid
                .as_slice()
                .try_into()
                .map_err(|_| EngineError::Dimension {
                    expected: SIGNATURE_DIM,
                    got: self.centroid.len(),
                })?;
        let mut recent_members: Deque<u64, MAX_TRACKED_MEMBERS> = Deque::new();
        let skip = self.recent_members.len().saturating_sub(MAX_TRACKED_MEMBERS);
        for turn in self.recent_members.into_iter().skip(skip) {
            // Length bounded by the skip above.
            let _ = recent_members.push_back(turn);
        }
        Ok(Family {
            id: self.id,
            name: self.name,
            centroid,
            member_count: self.member_count,
            outcome_count: self.outcome_count,
            mean_outcome: self.mean_outcome,
            recent_members,
            created_turn: self.created_turn,
            last_turn: self.last_turn,
        })
    }
}

/// `families.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FamilySnapshot {
    /// Header.
    pub header: StoreHeader,
    /// Signatures clustered so far.
    pub total_assignments: u64,
    /// All families, in creation order.
    pub families: Vec<FamilyRecord>,
}

impl FamilySnapshot {
    /// Artifact name in the header.
    pub const ARTIFACT: &'static str = "families";

    /// Capture a clusterer.
    pub fn capture(clusterer: &FamilyClusterer, layout_tag: &str) -> Self {
        Self {
            header: StoreHeader::new(Self::ARTIFACT, layout_tag),
            total_assignments: clusterer.total_assignments(),
            families: clusterer.families().iter().map(FamilyRecord::from).collect(),
        }
    }

    /// Rebuild a clusterer with `config`.
    pub fn restore(self, config: ClusterConfig) -> EngineResult<FamilyClusterer> {
        let families = self
            .families
            .into_iter()
            .map(FamilyRecord::into_family)
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(FamilyClusterer::from_parts(config, families, self.total_assignments))
    }
}

// ─── Coupling ───────────────────────────────────────────────────────────────

/// `coupling.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CouplingSnapshot {
    /// Header.
    pub header: StoreHeader,
    /// Source names, in registration order.
    pub sources: Vec<String>,
    /// Row-major N×N values.
    pub values: Vec<f32>,
    /// Cycles observed.
    pub updates: u64,
}

impl CouplingSnapshot {
    /// Artifact name in the header.
    pub const ARTIFACT: &'static str = "coupling";

    /// Capture a learner.
    pub fn capture(learner: &CouplingLearner, layout_tag: &str) -> Self {
        Self {
            header: StoreHeader::new(Self::ARTIFACT, layout_tag),
            sources: learner.matrix().names().to_vec(),
            values: learner.matrix().as_slice().to_vec(),
            updates: learner.updates(),
        }
    }

    /// Rebuild a learner. The stored sources must equal `sources` by name and order.
    pub fn restore(self, config: CouplingConfig, sources: &[SourceSpec]) -> EngineResult<CouplingLearner> {
        let expected: Vec<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        if self.sources.iter().map(String::as_str).ne(expected.iter().copied()) {
            return Err(EngineError::Config(format!(
                "coupling store covers sources {:?}, expected {:?}",
                self.sources, expected
            )));
        }
        let matrix = CouplingMatrix::from_values(self.sources, self.values)?;
        Ok(CouplingLearner::from_parts(config, matrix, self.updates))
    }
}

// ─── Patterns ───────────────────────────────────────────────────────────────

/// Serializable form of one [`PatternBucket`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BucketRecord {
    /// Discretised signature.
    pub cells: Vec<i8>,
    /// Entries.
    pub entries: Vec<PatternEntry>,
}

/// `patterns.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PatternSnapshot {
    /// Header.
    pub header: StoreHeader,
    /// Discretisation step the cells were computed with.
    pub resolution: f32,
    /// All buckets.
    pub buckets: Vec<BucketRecord>,
}

impl PatternSnapshot {
    /// Artifact name in the header.
    pub const ARTIFACT: &'static str = "patterns";

    /// Capture a learner. Buckets are sorted by cells for stable output.
    pub fn capture(learner: &PatternLearner, layout_tag: &str) -> Self {
        let mut buckets: Vec<BucketRecord> = learner
            .buckets()
            .map(|b| BucketRecord {
                cells: b.cells.clone(),
                entries: b.entries.clone(),
            })
            .collect();
        buckets.sort_by(|a, b| a.cells.cmp(&b.cells));
        Self {
            header: StoreHeader::new(Self::ARTIFACT, layout_tag),
            resolution: learner.config().resolution,
            buckets,
        }
    }

    /// Rebuild a learner with `config`. Fails if the resolution or cell width differs.
    pub fn restore(self, config: PatternConfig) -> EngineResult<PatternLearner> {
        if (self.resolution - config.resolution).abs() > f32::EPSILON {
            return Err(EngineError::SchemaMismatch {
                artifact: Self::ARTIFACT.to_string(),
                expected: format!("resolution {}", config.resolution),
                found: format!("resolution {}", self.resolution),
            });
        }
        if let Some(bad) = self.buckets.iter().find(|b| b.cells.len() != SIGNATURE_DIM) {
            return Err(EngineError::Dimension {
                expected: SIGNATURE_DIM,
                got: bad.cells.len(),
            });
        }
        let buckets = self
            .buckets
            .into_iter()
            .map(|b| PatternBucket {
                cells: b.cells,
                entries: b.entries,
            })
            .collect();
        Ok(PatternLearner::from_buckets(config, buckets))
    }
}

// ─── WriterLock ─────────────────────────────────────────────────────────────

/// Exclusive right to write a store directory. Released on drop.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    /// Acquire the lock for `dir`, creating the directory if needed.
    pub fn acquire(dir: impl AsRef<Path>) -> EngineResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(&path)
                    .ok()
                    .and_then(|pid| pid.trim().parse::<u32>().ok());
                return Err(EngineError::StoreLocked { path, owner });
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "writer lock acquired");
        Ok(Self { path })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "writer lock already gone");
        }
    }
}

// ─── StoreDirectory ─────────────────────────────────────────────────────────

/// A directory holding the three artifacts for one signature layout.
#[derive(Clone, Debug)]
pub struct StoreDirectory {
    root: PathBuf,
    layout_tag: String,
}

impl StoreDirectory {
    /// Artifacts under `root`, checked against `layout`.
    pub fn new(root: impl Into<PathBuf>, layout: &SignatureLayout) -> Self {
        Self {
            root: root.into(),
            layout_tag: layout.tag(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Layout tag every artifact must carry.
    pub fn layout_tag(&self) -> &str {
        &self.layout_tag
    }

    /// Load `families.json`. `None` when absent.
    pub fn load_families(&self, config: ClusterConfig) -> EngineResult<Option<FamilyClusterer>> {
        self.read::<FamilySnapshot>(FAMILIES_FILE, FamilySnapshot::ARTIFACT)?
            .map(|s| s.restore(config))
            .transpose()
    }

    /// Load `coupling.json`. `None` when absent.
    pub fn load_coupling(&self, config: CouplingConfig, sources: &[SourceSpec]) -> EngineResult<Option<CouplingLearner>> {
        self.read::<CouplingSnapshot>(COUPLING_FILE, CouplingSnapshot::ARTIFACT)?
            .map(|s| s.restore(config, sources))
            .transpose()
    }

    /// Load `patterns.json`. `None` when absent.
    pub fn load_patterns(&self, config: PatternConfig) -> EngineResult<Option<PatternLearner>> {
        self.read::<PatternSnapshot>(PATTERNS_FILE, PatternSnapshot::ARTIFACT)?
            .map(|s| s.restore(config))
            .transpose()
    }

    /// Load all three artifacts, starting fresh for any that are absent.
    pub fn load_all(&self, config: &EngineConfig, sources: &[SourceSpec]) -> EngineResult<SharedStores> {
        config.validate()?;
        let families = match self.load_families(config.clustering.clone())? {
            Some(f) => f,
            None => FamilyClusterer::new(config.clustering.clone()),
        };
        let coupling = match self.load_coupling(config.coupling.clone(), sources)? {
            Some(c) => c,
            None => CouplingLearner::new(config.coupling.clone(), sources)?,
        };
        let patterns = match self.load_patterns(config.patterns.clone())? {
            Some(p) => p,
            None => PatternLearner::new(config.patterns.clone()),
        };
        info!(
            root = %self.root.display(),
            families = families.len(),
            patterns = patterns.len(),
            "stores loaded"
        );
        Ok(SharedStores::from_parts(families, coupling, patterns))
    }

    /// Take the writer lock, then load all three artifacts under it.
    ///
    /// Fails with [`EngineError::StoreLocked`] while another writer is open.
    pub fn open_writer(&self, config: &EngineConfig, sources: &[SourceSpec]) -> EngineResult<StoreWriter> {
        let lock = WriterLock::acquire(&self.root)?;
        let stores = self.load_all(config, sources)?;
        Ok(StoreWriter {
            directory: self.clone(),
            stores,
            lock,
        })
    }

    fn write_all(&self, stores: &SharedStores) -> EngineResult<()> {
        let families = FamilySnapshot::capture(&stores.families.lock(), &self.layout_tag);
        let coupling = CouplingSnapshot::capture(&stores.coupling.lock(), &self.layout_tag);
        let patterns = PatternSnapshot::capture(&stores.patterns.lock(), &self.layout_tag);

        write_atomic(&self.root.join(FAMILIES_FILE), &families)?;
        write_atomic(&self.root.join(COUPLING_FILE), &coupling)?;
        write_atomic(&self.root.join(PATTERNS_FILE), &patterns)?;
        info!(
            root = %self.root.display(),
            families = families.families.len(),
            buckets = patterns.buckets.len(),
            "stores flushed"
        );
        Ok(())
    }

    fn read<T: DeserializeOwned>(&self, file: &str, artifact: &str) -> EngineResult<Option<T>> {
        let path = self.root.join(file);
        let mut buf = String::new();
        match File::open(&path) {
            Ok(mut f) => {
                f.read_to_string(&mut buf)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let head: HeaderOnly = serde_json::from_str(&buf)?;
        head.header.check(artifact, &self.layout_tag)?;
        Ok(Some(serde_json::from_str(&buf)?))
    }
}

// ─── StoreWriter ────────────────────────────────────────────────────────────

/// Stores loaded under the writer lock. The lock is held until this is dropped.
#[derive(Debug)]
pub struct StoreWriter {
    directory: StoreDirectory,
    stores: SharedStores,
    lock: WriterLock,
}

impl StoreWriter {
    /// The loaded stores. Clone the handle into conversations to mutate them.
    pub fn stores(&self) -> &SharedStores {
        &self.stores
    }

    /// Directory being written.
    pub fn directory(&self) -> &StoreDirectory {
        &self.directory
    }

    /// Lock file held by this writer.
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Write all three artifacts. May be called any number of times.
    pub fn flush(&self) -> EngineResult<()> {
        self.directory.write_all(&self.stores)
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> EngineResult<()> {
    let tmp = path.with_extension("json.tmp");
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut f = File::create(&tmp)?;
    f.write_all(serde_json::to_string_pretty(value)?.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ─── Tests ──────────────────────────────────────────────────────────────────

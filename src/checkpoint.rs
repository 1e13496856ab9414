//! Checkpoint artifacts: save, partial load and rotation.
//!
//! # Format
//!
//! One artifact is a single safetensors file. Tensor names are
//! `"<section>.<rest>"`:
//!
//! | Section | Name layout | Contents |
//! |---|---|---|
//! | `state_dict` | `state_dict.<stage>.<param>` | live weights of every stage |
//! | `ema_state` | `ema_state.<param>` | upstream (VAE) shadow weights |
//! | `ema_state_dm` | `ema_state_dm.<param>` | downstream (DM) shadow weights |
//! | `optimizer_states` | `optimizer_states.exp_avg.<stage>.<param>` | AdamW moments |
//!
//! The safetensors `__metadata__` map carries the format marker, step/epoch
//! counters, the JSON-encoded [`TrainerState`], the JSON-encoded scheduler and
//! a creation timestamp.
//!
//! Writes go to a temporary file in the destination directory which is synced
//! and renamed over the target, so readers never observe a partial artifact.
//!
//! # Usage
//!
//! ```rust,ignore
//! let bundle = CheckpointBundle::new(&state)
//!     .with_primary(StageId::Dm, &dm_live)
//!     .with_shadow(ShadowKey::Downstream, &dm_shadow);
//! CheckpointCodec::save("checkpoint_step_00001000.safetensors", &bundle)?;
//!
//! // Cross-stage load: only `state_dict.vae.*` is considered.
//! let report = CheckpointCodec::load_primary(path, &mut vae, StageId::Vae, AfterLoad::Freeze)?;
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{Result, TrajError};
use crate::optimizer::OptimizerState;
use crate::params::{ParamKey, ParameterStore, StageId};
use crate::scheduler::LRScheduler;
use crate::state::TrainerState;

/// Value of the `format` metadata key.
pub const FORMAT_VERSION: &str = "traj-ldm/1";

const PRIMARY_SECTION: &str = "state_dict";
const OPTIMIZER_SECTION: &str = "optimizer_states";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

const META_FORMAT: &str = "format";
const META_GLOBAL_STEP: &str = "global_step";
const META_EPOCH: &str = "epoch";
const META_TRAINER_STATE: &str = "trainer_state";
const META_SCHEDULERS: &str = "lr_schedulers";
const META_CREATED_AT: &str = "created_at";

/// Shadow sections of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShadowKey {
    /// Shadow of the upstream VAE (`ema_state`).
    Upstream,
    /// Shadow of the downstream diffusion model (`ema_state_dm`).
    Downstream,
}

impl ShadowKey {
    /// Section name on disk.
    #[must_use]
    pub const fn section(self) -> &'static str {
        match self {
            ShadowKey::Upstream => "ema_state",
            ShadowKey::Downstream => "ema_state_dm",
        }
    }

    /// Inverse of [`ShadowKey::section`].
    #[must_use]
    pub fn from_section(section: &str) -> Option<Self> {
        match section {
            "ema_state" => Some(ShadowKey::Upstream),
            "ema_state_dm" => Some(ShadowKey::Downstream),
            _ => None,
        }
    }
}

impl fmt::Display for ShadowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

/// What happens to the target store after a primary load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterLoad {
    /// Disable gradients for every parameter of the target.
    Freeze,
    /// Leave gradient flags as they were.
    KeepTrainable,
}

/// Keys that did not line up during a partial load.
///
/// Not an error: the load proceeds with the matching keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMismatch {
    /// In the target, absent from the filtered source.
    pub missing: Vec<String>,
    /// In the filtered source, absent from the target.
    pub unexpected: Vec<String>,
}

impl KeyMismatch {
    fn between<'a>(
        target: impl Iterator<Item = &'a str>,
        source: impl Iterator<Item = &'a str>,
    ) -> Self {
        let target: BTreeSet<&str> = target.collect();
        let source: BTreeSet<&str> = source.collect();
        Self {
            missing: target.difference(&source).map(|s| (*s).to_string()).collect(),
            unexpected: source.difference(&target).map(|s| (*s).to_string()).collect(),
        }
    }

    /// True when source and target key sets were identical.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Result of loading a shadow section that was present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowLoad {
    /// Parameters copied.
    pub loaded: usize,
    /// Keys skipped on either side.
    pub keys: KeyMismatch,
}

/// Everything written into one artifact.
#[derive(Debug, Clone)]
pub struct CheckpointBundle<'a> {
    /// Live stores keyed by stage.
    pub primary: Vec<(StageId, &'a ParameterStore)>,
    /// Shadow stores keyed by section.
    pub shadows: Vec<(ShadowKey, &'a ParameterStore)>,
    /// Step counters and scalars.
    pub trainer_state: &'a TrainerState,
    /// Optimizer moments.
    pub optimizer: Option<&'a OptimizerState>,
    /// Learning rate scheduler.
    pub scheduler: Option<&'a LRScheduler>,
}

impl<'a> CheckpointBundle<'a> {
    /// Empty bundle around `trainer_state`.
    #[must_use]
    pub fn new(trainer_state: &'a TrainerState) -> Self {
        Self {
            primary: Vec::new(),
            shadows: Vec::new(),
            trainer_state,
            optimizer: None,
            scheduler: None,
        }
    }

    /// Add a live store.
    #[must_use]
    pub fn with_primary(mut self, stage: StageId, store: &'a ParameterStore) -> Self {
        self.primary.push((stage, store));
        self
    }

    /// Add a shadow store.
    #[must_use]
    pub fn with_shadow(mut self, key: ShadowKey, store: &'a ParameterStore) -> Self {
        self.shadows.push((key, store));
        self
    }

    /// Attach optimizer moments.
    #[must_use]
    pub fn with_optimizer(mut self, state: &'a OptimizerState) -> Self {
        self.optimizer = Some(state);
        self
    }

    /// Attach the scheduler.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: &'a LRScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

/// Tensor count and element count of one section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionSummary {
    /// Number of tensors.
    pub tensors: usize,
    /// Number of scalar elements.
    pub elements: usize,
}

/// Overview of an artifact without materializing its tensors.
#[derive(Debug, Clone)]
pub struct ArtifactSummary {
    /// Artifact path.
    pub path: PathBuf,
    /// Format marker.
    pub format: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: Option<String>,
    /// Recorded trainer state.
    pub trainer_state: TrainerState,
    /// Whether a scheduler was recorded.
    pub has_scheduler: bool,
    /// Sections keyed by label (`state_dict.vae`, `ema_state`, ...).
    pub sections: BTreeMap<String, SectionSummary>,
}

impl ArtifactSummary {
    /// Whether the shadow section `key` is present.
    #[must_use]
    pub fn has_shadow(&self, key: ShadowKey) -> bool {
        self.sections.contains_key(key.section())
    }
}

impl fmt::Display for ArtifactSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "artifact:    {}", self.path.display())?;
        writeln!(f, "format:      {}", self.format)?;
        if let Some(created_at) = &self.created_at {
            writeln!(f, "created_at:  {created_at}")?;
        }
        writeln!(f, "global_step: {}", self.trainer_state.global_step)?;
        writeln!(f, "epoch:       {}", self.trainer_state.epoch)?;
        if let Some(best) = self.trainer_state.best_val_loss {
            writeln!(f, "best_val:    {best:.6}")?;
        }
        writeln!(f, "sections:")?;
        for (label, section) in &self.sections {
            writeln!(
                f,
                "  {label:<32} {:>5} tensors {:>10} params",
                section.tensors, section.elements
            )?;
        }
        Ok(())
    }
}

struct Header {
    format: String,
    created_at: Option<String>,
    trainer_state: TrainerState,
    scheduler: Option<LRScheduler>,
}

struct Artifact {
    header: Header,
    tensors: HashMap<String, Tensor>,
}

impl Artifact {
    fn section<'s>(&'s self, prefix: &'s str) -> impl Iterator<Item = (&'s str, &'s Tensor)> + 's {
        self.tensors
            .iter()
            .filter_map(move |(name, t)| name.strip_prefix(prefix).map(|rest| (rest, t)))
    }
}

/// Reads and writes checkpoint artifacts.
pub struct CheckpointCodec;

impl CheckpointCodec {
    /// Write `bundle` to `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or any filesystem step fails. No
    /// partial artifact is left at `path` in that case.
    pub fn save(path: impl AsRef<Path>, bundle: &CheckpointBundle<'_>) -> Result<()> {
        let path = path.as_ref();
        let mut tensors: Vec<(String, Tensor)> = Vec::new();

        for (stage, store) in &bundle.primary {
            for (name, t) in store.snapshot() {
                tensors.push((format!("{PRIMARY_SECTION}.{}", ParamKey::new(*stage, name)), t));
            }
        }
        for (key, store) in &bundle.shadows {
            for (name, t) in store.snapshot() {
                tensors.push((format!("{}.{name}", key.section()), t));
            }
        }
        if let Some(optimizer) = bundle.optimizer {
            for (key, t) in &optimizer.exp_avg {
                tensors.push((format!("{OPTIMIZER_SECTION}.{EXP_AVG}.{key}"), t.clone()));
            }
            for (key, t) in &optimizer.exp_avg_sq {
                tensors.push((format!("{OPTIMIZER_SECTION}.{EXP_AVG_SQ}.{key}"), t.clone()));
            }
        }

        let state = bundle.trainer_state;
        let mut metadata = HashMap::new();
        metadata.insert(META_FORMAT.to_string(), FORMAT_VERSION.to_string());
        metadata.insert(META_GLOBAL_STEP.to_string(), state.global_step.to_string());
        metadata.insert(META_EPOCH.to_string(), state.epoch.to_string());
        metadata.insert(META_TRAINER_STATE.to_string(), serde_json::to_string(state)?);
        if let Some(scheduler) = bundle.scheduler {
            metadata.insert(META_SCHEDULERS.to_string(), serde_json::to_string(scheduler)?);
        }
        metadata.insert(META_CREATED_AT.to_string(), chrono::Utc::now().to_rfc3339());

        let count = tensors.len();
        let bytes = safetensors::serialize(tensors, &Some(metadata))
            .map_err(|e| TrajError::Checkpoint(format!("failed to serialize checkpoint: {e}")))?;
        write_atomic(path, &bytes)?;

        info!(
            path = %path.display(),
            step = state.global_step,
            tensors = count,
            bytes = bytes.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Copy the `stage` slice of the primary state into `target`.
    ///
    /// Only keys under `state_dict.<stage>.` are considered; the prefix is
    /// stripped and tensors are matched by exact name. Unmatched keys on
    /// either side are reported, never an error. With [`AfterLoad::Freeze`]
    /// every target parameter has gradients disabled afterwards.
    ///
    /// # Errors
    ///
    /// [`TrajError::ArtifactNotFound`], [`TrajError::CorruptArtifact`], or
    /// [`TrajError::ShapeMismatch`] if a matched key differs in shape. The
    /// target is left untouched on error.
    pub fn load_primary(
        path: impl AsRef<Path>,
        target: &mut ParameterStore,
        stage: StageId,
        after_load: AfterLoad,
    ) -> Result<KeyMismatch> {
        let path = path.as_ref();
        let artifact = read_artifact(path, target.device())?;
        let primary_prefix = format!("{PRIMARY_SECTION}.");

        let source: BTreeMap<String, &Tensor> = artifact
            .section(&primary_prefix)
            .filter_map(|(rest, t)| ParamKey::parse(rest).map(|key| (key, t)))
            .filter(|(key, _)| key.stage == stage)
            .map(|(key, t)| (key.name, t))
            .collect();

        let keys = KeyMismatch::between(target.names(), source.keys().map(String::as_str));
        let loaded = copy_matching(target, &source)?;

        if after_load == AfterLoad::Freeze {
            target.freeze();
        }

        info!(
            path = %path.display(),
            %stage,
            loaded,
            frozen = after_load == AfterLoad::Freeze,
            "loaded primary state"
        );
        if !keys.is_clean() {
            warn!(
                %stage,
                missing = ?keys.missing,
                unexpected = ?keys.unexpected,
                "partial primary load: key mismatch"
            );
        }
        Ok(keys)
    }

    /// Copy a shadow section into `target`.
    ///
    /// Returns `Ok(None)` when the artifact has no such section, which simply
    /// means no shadow weights were recorded.
    ///
    /// # Errors
    ///
    /// Same artifact-level failures as [`CheckpointCodec::load_primary`].
    pub fn load_shadow(
        path: impl AsRef<Path>,
        target: &mut ParameterStore,
        key: ShadowKey,
    ) -> Result<Option<ShadowLoad>> {
        let path = path.as_ref();
        let artifact = read_artifact(path, target.device())?;
        let prefix = format!("{}.", key.section());

        let source: BTreeMap<String, &Tensor> = artifact
            .section(&prefix)
            .map(|(name, t)| (name.to_string(), t))
            .collect();
        if source.is_empty() {
            info!(path = %path.display(), section = %key, "no shadow section recorded; skipping");
            return Ok(None);
        }

        let keys = KeyMismatch::between(target.names(), source.keys().map(String::as_str));
        let loaded = copy_matching(target, &source)?;

        info!(path = %path.display(), section = %key, loaded, "loaded shadow state");
        if !keys.is_clean() {
            warn!(
                section = %key,
                missing = keys.missing.len(),
                unexpected = keys.unexpected.len(),
                "shadow load skipped unmatched keys"
            );
            debug!(missing = ?keys.missing, unexpected = ?keys.unexpected, "shadow key mismatch");
        }
        Ok(Some(ShadowLoad { loaded, keys }))
    }

    /// Trainer state recorded in the artifact.
    ///
    /// # Errors
    ///
    /// [`TrajError::ArtifactNotFound`] or [`TrajError::CorruptArtifact`].
    pub fn load_trainer_state(path: impl AsRef<Path>) -> Result<TrainerState> {
        let path = path.as_ref();
        let bytes = read_bytes(path)?;
        Ok(read_header(path, &bytes)?.trainer_state)
    }

    /// Scheduler recorded in the artifact, if any.
    ///
    /// # Errors
    ///
    /// [`TrajError::ArtifactNotFound`] or [`TrajError::CorruptArtifact`].
    pub fn load_scheduler(path: impl AsRef<Path>) -> Result<Option<LRScheduler>> {
        let path = path.as_ref();
        let bytes = read_bytes(path)?;
        Ok(read_header(path, &bytes)?.scheduler)
    }

    /// Optimizer moments recorded in the artifact, if any.
    ///
    /// The bias-correction counter comes from the recorded trainer state.
    ///
    /// # Errors
    ///
    /// [`TrajError::ArtifactNotFound`] or [`TrajError::CorruptArtifact`].
    pub fn load_optimizer_state(path: impl AsRef<Path>, device: &Device) -> Result<Option<OptimizerState>> {
        let path = path.as_ref();
        let artifact = read_artifact(path, device)?;

        let moments = |kind: &str| -> BTreeMap<ParamKey, Tensor> {
            let prefix = format!("{OPTIMIZER_SECTION}.{kind}.");
            artifact
                .section(&prefix)
                .filter_map(|(rest, t)| {
                    let key = ParamKey::parse(rest);
                    if key.is_none() {
                        warn!(name = rest, "ignoring optimizer moment with unknown stage");
                    }
                    key.map(|k| (k, t.clone()))
                })
                .collect()
        };

        let state = OptimizerState {
            step: artifact.header.trainer_state.optimizer_step,
            exp_avg: moments(EXP_AVG),
            exp_avg_sq: moments(EXP_AVG_SQ),
        };
        if state.is_empty() {
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Summarize sections and counters without loading tensors onto a device.
    ///
    /// # Errors
    ///
    /// [`TrajError::ArtifactNotFound`] or [`TrajError::CorruptArtifact`].
    pub fn inspect(path: impl AsRef<Path>) -> Result<ArtifactSummary> {
        let path = path.as_ref();
        let bytes = read_bytes(path)?;
        let header = read_header(path, &bytes)?;
        let st = SafeTensors::deserialize(&bytes).map_err(|e| TrajError::corrupt(path, e.to_string()))?;

        let mut sections: BTreeMap<String, SectionSummary> = BTreeMap::new();
        for (name, view) in st.tensors() {
            let label = section_label(&name);
            let entry = sections.entry(label).or_default();
            entry.tensors += 1;
            entry.elements += view.shape().iter().product::<usize>();
        }

        Ok(ArtifactSummary {
            path: path.to_path_buf(),
            format: header.format,
            created_at: header.created_at,
            has_scheduler: header.scheduler.is_some(),
            trainer_state: header.trainer_state,
            sections,
        })
    }
}

fn section_label(name: &str) -> String {
    let mut parts = name.splitn(3, '.');
    let section = parts.next().unwrap_or_default();
    match (section, parts.next()) {
        (PRIMARY_SECTION, Some(stage)) => format!("{section}.{stage}"),
        (OPTIMIZER_SECTION, Some(kind)) => format!("{section}.{kind}"),
        _ => section.to_string(),
    }
}

/// Validate every shape first, then copy, so a mismatch leaves `target` untouched.
fn copy_matching(target: &mut ParameterStore, source: &BTreeMap<String, &Tensor>) -> Result<usize> {
    for (name, t) in source {
        if let Some(expected) = target.shape(name) {
            if expected != t.dims() {
                return Err(TrajError::ShapeMismatch {
                    key: name.clone(),
                    expected: expected.to_vec(),
                    got: t.dims().to_vec(),
                });
            }
        }
    }
    let mut loaded = 0;
    for (name, t) in source {
        if target.contains(name) {
            target.assign(name, t)?;
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(TrajError::ArtifactNotFound(path.to_path_buf()));
    }
    Ok(std::fs::read(path)?)
}

fn read_header(path: &Path, bytes: &[u8]) -> Result<Header> {
    let (_, metadata) =
        SafeTensors::read_metadata(bytes).map_err(|e| TrajError::corrupt(path, e.to_string()))?;
    let metadata = metadata.metadata().clone().unwrap_or_default();

    let format = metadata
        .get(META_FORMAT)
        .ok_or_else(|| TrajError::corrupt(path, "missing format marker"))?;
    if format != FORMAT_VERSION {
        return Err(TrajError::corrupt(
            path,
            format!("unsupported format '{format}' (expected '{FORMAT_VERSION}')"),
        ));
    }

    let trainer_state = metadata
        .get(META_TRAINER_STATE)
        .ok_or_else(|| TrajError::corrupt(path, "missing trainer_state"))
        .and_then(|raw| {
            serde_json::from_str::<TrainerState>(raw)
                .map_err(|e| TrajError::corrupt(path, format!("invalid trainer_state: {e}")))
        })?;

    let scheduler = metadata
        .get(META_SCHEDULERS)
        .map(|raw| {
            serde_json::from_str::<LRScheduler>(raw)
                .map_err(|e| TrajError::corrupt(path, format!("invalid lr_schedulers: {e}")))
        })
        .transpose()?;

    Ok(Header {
        format: format.clone(),
        created_at: metadata.get(META_CREATED_AT).cloned(),
        trainer_state,
        scheduler,
    })
}

fn read_artifact(path: &Path, device: &Device) -> Result<Artifact> {
    let bytes = read_bytes(path)?;
    let header = read_header(path, &bytes)?;
    let tensors = candle_core::safetensors::load_buffer(&bytes, device)
        .map_err(|e| TrajError::corrupt(path, e.to_string()))?;

    let primary_prefix = format!("{PRIMARY_SECTION}.");
    if !tensors.keys().any(|name| name.starts_with(&primary_prefix)) {
        return Err(TrajError::corrupt(path, "no primary state section"));
    }
    debug!(path = %path.display(), tensors = tensors.len(), "read checkpoint artifact");
    Ok(Artifact { header, tensors })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| TrajError::Io(e.error))?;
    Ok(())
}

/// Periodic saving, rotation and discovery of artifacts in one directory.
pub struct CheckpointManager {
    /// Directory where checkpoints are saved.
    checkpoint_dir: PathBuf,

    /// Save checkpoint every N steps.
    save_interval: usize,

    /// Number of checkpoints to keep (0 keeps all).
    keep_last_n: usize,

    /// Known checkpoint files, oldest first.
    checkpoints: Vec<PathBuf>,

    /// Best-validation artifacts kept (0 disables them).
    best_k: usize,

    /// Best-validation artifacts with their loss, lowest first.
    best: Vec<(f64, PathBuf)>,
}

impl CheckpointManager {
    /// Creates a new checkpoint manager.
    ///
    /// # Arguments
    ///
    /// * `checkpoint_dir` - Directory for checkpoints (created if doesn't exist)
    /// * `save_interval` - Save every N steps
    /// * `keep_last_n` - Number of checkpoints to keep
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation or scanning fails.
    pub fn new(checkpoint_dir: impl AsRef<Path>, save_interval: usize, keep_last_n: usize) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            TrajError::Checkpoint(format!(
                "failed to create checkpoint directory {}: {e}",
                checkpoint_dir.display()
            ))
        })?;
        let checkpoints = Self::scan_checkpoints(&checkpoint_dir)?;

        Ok(Self {
            checkpoint_dir,
            save_interval,
            keep_last_n,
            checkpoints,
            best_k: 0,
            best: Vec::new(),
        })
    }

    /// Keep the `best_k` artifacts with the lowest validation loss under
    /// [`CheckpointManager::best_dir`]. Rotation never touches them.
    ///
    /// # Errors
    ///
    /// Returns an error if the best directory cannot be created or scanned.
    pub fn with_best_k(mut self, best_k: usize) -> Result<Self> {
        self.best_k = best_k;
        if best_k > 0 {
            let dir = self.best_dir();
            std::fs::create_dir_all(&dir)?;
            self.best = Self::scan_best(&dir)?;
        }
        Ok(self)
    }

    /// Checks if a checkpoint should be saved at the given step.
    #[must_use]
    pub fn should_save(&self, step: usize) -> bool {
        self.save_interval > 0 && step > 0 && step % self.save_interval == 0
    }

    /// Artifact path for `step`.
    #[must_use]
    pub fn path_for(&self, step: usize) -> PathBuf {
        self.checkpoint_dir
            .join(format!("checkpoint_step_{step:08}.safetensors"))
    }

    /// Saves a checkpoint and manages rotation.
    ///
    /// # Errors
    ///
    /// Returns an error if saving or rotation fails.
    pub fn save(&mut self, bundle: &CheckpointBundle<'_>) -> Result<PathBuf> {
        let path = self.path_for(bundle.trainer_state.global_step);
        CheckpointCodec::save(&path, bundle)?;

        if !self.checkpoints.contains(&path) {
            self.checkpoints.push(path.clone());
        }
        self.rotate_checkpoints()?;
        Ok(path)
    }

    /// Directory holding best-validation artifacts.
    #[must_use]
    pub fn best_dir(&self) -> PathBuf {
        self.checkpoint_dir.join("best")
    }

    /// Best-validation artifacts, lowest loss first.
    #[must_use]
    pub fn best_checkpoints(&self) -> Vec<&Path> {
        self.best.iter().map(|(_, path)| path.as_path()).collect()
    }

    /// Whether a validation loss would enter the kept best set.
    #[must_use]
    pub fn qualifies_as_best(&self, loss: f64) -> bool {
        if self.best_k == 0 || !loss.is_finite() {
            return false;
        }
        self.best.len() < self.best_k || self.best.last().is_some_and(|(worst, _)| loss < *worst)
    }

    /// Save `bundle` as a best-validation artifact if `loss` qualifies,
    /// dropping the worst one beyond `best_k`.
    ///
    /// # Errors
    ///
    /// Returns an error if saving or deleting an artifact fails.
    pub fn save_best(&mut self, bundle: &CheckpointBundle<'_>, loss: f64) -> Result<Option<PathBuf>> {
        if !self.qualifies_as_best(loss) {
            return Ok(None);
        }
        let step = bundle.trainer_state.global_step;
        let path = self
            .best_dir()
            .join(format!("checkpoint_best_step_{step:08}_val_{loss}.safetensors"));
        CheckpointCodec::save(&path, bundle)?;

        self.best.retain(|(_, existing)| existing != &path);
        let at = self.best.partition_point(|(l, _)| *l <= loss);
        self.best.insert(at, (loss, path.clone()));
        while self.best.len() > self.best_k {
            if let Some((_, old)) = self.best.pop() {
                std::fs::remove_file(&old).map_err(|e| {
                    TrajError::Checkpoint(format!(
                        "failed to delete best checkpoint {}: {e}",
                        old.display()
                    ))
                })?;
                debug!(path = %old.display(), "dropped best checkpoint");
            }
        }
        Ok(Some(path))
    }

    /// Returns the path to the most recent checkpoint.
    #[must_use]
    pub fn latest_checkpoint_path(&self) -> Option<&Path> {
        self.checkpoints.last().map(PathBuf::as_path)
    }

    /// Known checkpoints, oldest first.
    #[must_use]
    pub fn checkpoints(&self) -> &[PathBuf] {
        &self.checkpoints
    }

    /// Checkpoint directory.
    #[must_use]
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    fn step_of(path: &Path) -> Option<usize> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("checkpoint_step_"))
            .and_then(|s| s.parse().ok())
    }

    /// Scans directory for existing checkpoints.
    fn scan_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut checkpoints: Vec<PathBuf> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension().and_then(|s| s.to_str()) == Some("safetensors")
                    && Self::step_of(path).is_some()
            })
            .collect();

        checkpoints.sort_by_key(|path| Self::step_of(path).unwrap_or(0));
        Ok(checkpoints)
    }

    fn loss_of(path: &Path) -> Option<f64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("checkpoint_best_step_"))
            .and_then(|s| s.split_once("_val_"))
            .and_then(|(_, loss)| loss.parse().ok())
    }

    fn scan_best(dir: &Path) -> Result<Vec<(f64, PathBuf)>> {
        let mut best: Vec<(f64, PathBuf)> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("safetensors"))
            .filter_map(|path| Self::loss_of(&path).map(|loss| (loss, path)))
            .collect();
        best.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(best)
    }

    /// Rotates old checkpoints to keep only the last N.
    fn rotate_checkpoints(&mut self) -> Result<()> {
        if self.keep_last_n == 0 {
            return Ok(());
        }
        while self.checkpoints.len() > self.keep_last_n {
            let old = self.checkpoints.remove(0);
            std::fs::remove_file(&old).map_err(|e| {
                TrajError::Checkpoint(format!(
                    "failed to delete old checkpoint {}: {e}",
                    old.display()
                ))
            })?;
            debug!(path = %old.display(), "rotated out checkpoint");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::TempDir;

    fn store(names: &[&str], fill: f32) -> ParameterStore {
        let device = Device::Cpu;
        let mut s = ParameterStore::new(&device);
        for (i, name) in names.iter().enumerate() {
            let t = Tensor::arange(0f32, 6f32, &device)
                .unwrap()
                .affine(1.0, f64::from(fill) + i as f64)
                .unwrap()
                .reshape((2, 3))
                .unwrap();
            s.insert(*name, &t, true).unwrap();
        }
        s
    }

    fn values(s: &ParameterStore, name: &str) -> Vec<f32> {
        s.value(name).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn save_primary(path: &Path, stage: StageId, s: &ParameterStore) {
        let state = TrainerState::new();
        CheckpointCodec::save(path, &CheckpointBundle::new(&state).with_primary(stage, s)).unwrap();
    }

    #[test]
    fn test_roundtrip_is_bit_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let live = store(&["lstm_enc.lstm.weight_ih_l0", "mu.weight"], 0.123_456_7);
        let shadow = store(&["lstm_enc.lstm.weight_ih_l0", "mu.weight"], -3.5);

        let mut state = TrainerState::new();
        state.global_step = 42;
        state.epoch = 3;
        CheckpointCodec::save(
            &path,
            &CheckpointBundle::new(&state)
                .with_primary(StageId::Vae, &live)
                .with_shadow(ShadowKey::Upstream, &shadow),
        )
        .unwrap();

        let mut restored = store(&["lstm_enc.lstm.weight_ih_l0", "mu.weight"], 0.0);
        let keys =
            CheckpointCodec::load_primary(&path, &mut restored, StageId::Vae, AfterLoad::KeepTrainable)
                .unwrap();
        assert!(keys.is_clean());
        for name in live.names() {
            assert_eq!(values(&restored, name), values(&live, name));
        }

        let mut restored_shadow = store(&["lstm_enc.lstm.weight_ih_l0", "mu.weight"], 0.0);
        let load = CheckpointCodec::load_shadow(&path, &mut restored_shadow, ShadowKey::Upstream)
            .unwrap()
            .unwrap();
        assert_eq!(load.loaded, 2);
        for name in shadow.names() {
            assert_eq!(values(&restored_shadow, name), values(&shadow, name));
        }

        let loaded_state = CheckpointCodec::load_trainer_state(&path).unwrap();
        assert_eq!(loaded_state.global_step, 42);
        assert_eq!(loaded_state.epoch, 3);
    }

    #[test]
    fn test_partial_load_reports_missing_and_unexpected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let source = store(&["a", "b", "c"], 10.0);
        save_primary(&path, StageId::Vae, &source);

        let mut target = store(&["b", "c", "d"], 0.0);
        let d_before = values(&target, "d");
        let keys =
            CheckpointCodec::load_primary(&path, &mut target, StageId::Vae, AfterLoad::KeepTrainable)
                .unwrap();

        assert_eq!(keys.missing, vec!["d".to_string()]);
        assert_eq!(keys.unexpected, vec!["a".to_string()]);
        assert_eq!(values(&target, "b"), values(&source, "b"));
        assert_eq!(values(&target, "c"), values(&source, "c"));
        assert_eq!(values(&target, "d"), d_before);
    }

    #[test]
    fn test_stage_filter_ignores_other_stages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let vae = store(&["w"], 1.0);
        let dm = store(&["w"], 2.0);
        let state = TrainerState::new();
        CheckpointCodec::save(
            &path,
            &CheckpointBundle::new(&state)
                .with_primary(StageId::Vae, &vae)
                .with_primary(StageId::Dm, &dm),
        )
        .unwrap();

        let mut target = store(&["w"], 0.0);
        CheckpointCodec::load_primary(&path, &mut target, StageId::Dm, AfterLoad::KeepTrainable)
            .unwrap();
        assert_eq!(values(&target, "w"), values(&dm, "w"));
    }

    #[test]
    fn test_freeze_after_load_blocks_gradients() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_primary(&path, StageId::Vae, &store(&["w"], 1.0));

        let mut target = store(&["w"], 0.0);
        CheckpointCodec::load_primary(&path, &mut target, StageId::Vae, AfterLoad::Freeze).unwrap();

        assert!(target.is_frozen());
        let loss = target.tensor("w").unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(target.value("w").unwrap()).is_none());
    }

    #[test]
    fn test_missing_artifact() {
        let mut target = store(&["w"], 0.0);
        let err = CheckpointCodec::load_primary(
            "/nonexistent/ckpt.safetensors",
            &mut target,
            StageId::Vae,
            AfterLoad::Freeze,
        )
        .unwrap_err();
        assert!(matches!(err, TrajError::ArtifactNotFound(_)));
        assert!(err.is_fatal_artifact());
    }

    #[test]
    fn test_garbage_bytes_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.safetensors");
        std::fs::write(&path, b"definitely not a safetensors file").unwrap();

        let mut target = store(&["w"], 0.0);
        let err = CheckpointCodec::load_primary(&path, &mut target, StageId::Vae, AfterLoad::Freeze)
            .unwrap_err();
        assert!(matches!(err, TrajError::CorruptArtifact { .. }));
        assert!(!target.is_frozen());
    }

    #[test]
    fn test_foreign_safetensors_without_marker_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "state_dict.vae.w".to_string(),
            Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = CheckpointCodec::load_trainer_state(&path).unwrap_err();
        assert!(matches!(err, TrajError::CorruptArtifact { ref reason, .. } if reason.contains("format")));
    }

    #[test]
    fn test_shape_mismatch_is_fatal_and_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let mut source = ParameterStore::new(&Device::Cpu);
        source
            .insert("a", &Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(), true)
            .unwrap();
        source
            .insert("b", &Tensor::ones((4,), DType::F32, &Device::Cpu).unwrap(), true)
            .unwrap();
        save_primary(&path, StageId::Vae, &source);

        let mut target = store(&["a", "b"], 0.0);
        let before = values(&target, "a");
        let err = CheckpointCodec::load_primary(&path, &mut target, StageId::Vae, AfterLoad::Freeze)
            .unwrap_err();

        assert!(matches!(
            err,
            TrajError::ShapeMismatch { ref key, ref expected, ref got }
                if key == "b" && expected == &vec![2, 3] && got == &vec![4]
        ));
        assert_eq!(values(&target, "a"), before);
        assert!(!target.is_frozen());
    }

    #[test]
    fn test_missing_shadow_section_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_primary(&path, StageId::Vae, &store(&["w"], 1.0));

        let mut shadow = store(&["w"], 0.0);
        let result = CheckpointCodec::load_shadow(&path, &mut shadow, ShadowKey::Downstream).unwrap();
        assert!(result.is_none());
        assert_eq!(values(&shadow, "w"), values(&store(&["w"], 0.0), "w"));
    }

    #[test]
    fn test_shadow_sections_do_not_alias() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let live = store(&["w"], 0.0);
        let up = store(&["w"], 1.0);
        let down = store(&["w"], 2.0);
        let state = TrainerState::new();
        CheckpointCodec::save(
            &path,
            &CheckpointBundle::new(&state)
                .with_primary(StageId::Dm, &live)
                .with_shadow(ShadowKey::Upstream, &up)
                .with_shadow(ShadowKey::Downstream, &down),
        )
        .unwrap();

        let mut target = store(&["w"], 9.0);
        CheckpointCodec::load_shadow(&path, &mut target, ShadowKey::Upstream).unwrap();
        assert_eq!(values(&target, "w"), values(&up, "w"));
        CheckpointCodec::load_shadow(&path, &mut target, ShadowKey::Downstream).unwrap();
        assert_eq!(values(&target, "w"), values(&down, "w"));
    }

    #[test]
    fn test_optimizer_and_scheduler_roundtrip() {
        use crate::scheduler::SchedulerType;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let live = store(&["w"], 1.0);

        let mut optimizer = OptimizerState::default();
        let key = ParamKey::new(StageId::Dm, "w");
        optimizer
            .exp_avg
            .insert(key.clone(), Tensor::full(0.25f32, (2, 3), &Device::Cpu).unwrap());
        optimizer
            .exp_avg_sq
            .insert(key.clone(), Tensor::full(0.5f32, (2, 3), &Device::Cpu).unwrap());
        let scheduler = LRScheduler::new(SchedulerType::one_cycle(100, 0.3), 1e-3);
        let mut state = TrainerState::new();
        state.optimizer_step = 17;

        CheckpointCodec::save(
            &path,
            &CheckpointBundle::new(&state)
                .with_primary(StageId::Dm, &live)
                .with_optimizer(&optimizer)
                .with_scheduler(&scheduler),
        )
        .unwrap();

        let restored = CheckpointCodec::load_optimizer_state(&path, &Device::Cpu)
            .unwrap()
            .unwrap();
        assert_eq!(restored.step, 17);
        assert_eq!(
            restored.exp_avg[&key].flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0.25; 6]
        );
        assert!(restored.exp_avg_sq.contains_key(&key));
        assert_eq!(CheckpointCodec::load_scheduler(&path).unwrap(), Some(scheduler));
    }

    #[test]
    fn test_inspect_summarizes_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let vae = store(&["a", "b"], 0.0);
        let dm = store(&["x"], 0.0);
        let mut state = TrainerState::new();
        state.global_step = 7;
        CheckpointCodec::save(
            &path,
            &CheckpointBundle::new(&state)
                .with_primary(StageId::Vae, &vae)
                .with_primary(StageId::Dm, &dm)
                .with_shadow(ShadowKey::Downstream, &dm),
        )
        .unwrap();

        let summary = CheckpointCodec::inspect(&path).unwrap();
        assert_eq!(summary.format, FORMAT_VERSION);
        assert_eq!(summary.trainer_state.global_step, 7);
        assert_eq!(summary.sections["state_dict.vae"].tensors, 2);
        assert_eq!(summary.sections["state_dict.vae"].elements, 12);
        assert_eq!(summary.sections["state_dict.dm"].tensors, 1);
        assert!(summary.has_shadow(ShadowKey::Downstream));
        assert!(!summary.has_shadow(ShadowKey::Upstream));
        assert!(summary.to_string().contains("global_step: 7"));
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save_primary(&path, StageId::Vae, &store(&["w"], 1.0));
        save_primary(&path, StageId::Vae, &store(&["w"], 2.0));

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_checkpoint_manager_should_save() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 100, 3).unwrap();

        assert!(!manager.should_save(0));
        assert!(!manager.should_save(50));
        assert!(manager.should_save(100));
        assert!(!manager.should_save(150));
        assert!(manager.should_save(200));
    }

    #[test]
    fn test_checkpoint_manager_rotation_and_latest() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), 100, 2).unwrap();
        assert!(manager.latest_checkpoint_path().is_none());

        let live = store(&["w"], 1.0);
        for step in [100, 200, 300] {
            let mut state = TrainerState::new();
            state.global_step = step;
            manager
                .save(&CheckpointBundle::new(&state).with_primary(StageId::Dm, &live))
                .unwrap();
        }

        let steps: Vec<usize> = manager
            .checkpoints()
            .iter()
            .filter_map(|p| CheckpointManager::step_of(p))
            .collect();
        assert_eq!(steps, vec![200, 300]);
        assert!(!manager.path_for(100).exists());
        assert_eq!(manager.latest_checkpoint_path(), Some(manager.path_for(300).as_path()));

        let rescanned = CheckpointManager::new(temp_dir.path(), 100, 2).unwrap();
        assert_eq!(rescanned.checkpoints().len(), 2);
        assert!(rescanned
            .latest_checkpoint_path()
            .unwrap()
            .ends_with("checkpoint_step_00000300.safetensors"));
    }

    #[test]
    fn test_best_checkpoints_keep_lowest_loss_and_survive_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager::new(temp_dir.path(), 1, 1)
            .unwrap()
            .with_best_k(2)
            .unwrap();

        let live = store(&["w"], 1.0);
        for (step, loss) in [(1, 0.5), (2, 0.3), (3, 0.9), (4, 0.4)] {
            let mut state = TrainerState::new();
            state.global_step = step;
            let bundle = CheckpointBundle::new(&state).with_primary(StageId::Dm, &live);
            manager.save(&bundle).unwrap();
            let saved = manager.save_best(&bundle, loss).unwrap();
            assert_eq!(saved.is_some(), step != 3, "step {step}");
        }

        assert_eq!(manager.checkpoints().len(), 1);
        let best: Vec<f64> = manager
            .best_checkpoints()
            .iter()
            .filter_map(|p| CheckpointManager::loss_of(p))
            .collect();
        assert_eq!(best, vec![0.3, 0.4]);
        for path in manager.best_checkpoints() {
            assert!(path.exists());
            assert!(path.starts_with(manager.best_dir()));
        }
        assert!(!manager.qualifies_as_best(0.45));
        assert!(manager.qualifies_as_best(0.35));
        assert!(!manager.qualifies_as_best(f64::NAN));

        let rescanned = CheckpointManager::new(temp_dir.path(), 1, 1)
            .unwrap()
            .with_best_k(2)
            .unwrap();
        assert_eq!(rescanned.best_checkpoints().len(), 2);
        assert_eq!(rescanned.checkpoints().len(), 1);
    }

    #[test]
    fn test_best_checkpoints_disabled_by_default() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), 1, 1).unwrap();
        assert!(!manager.qualifies_as_best(0.1));
        assert!(!manager.best_dir().exists());
    }
}

//! Named parameter stores and typed stage keys.
//!
//! A [`ParameterStore`] owns one model's trainable state as `candle` [`Var`]s
//! keyed by dotted PyTorch-style names (`lstm_enc.lstm.weight_ih_l0`). Each
//! parameter carries a gradient-tracking flag: frozen parameters are handed to
//! models as detached tensors, so a backward pass never produces gradients for
//! them.
//!
//! Values are always replaced in place through [`Var::set`], which keeps every
//! tensor previously handed out by [`ParameterStore::tensor`] pointing at the
//! current weights.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrajError};

/// The two trainable stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    /// Upstream trajectory VAE.
    Vae,
    /// Downstream latent diffusion model.
    Dm,
}

impl StageId {
    /// Prefix used for this stage in the on-disk primary state.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            StageId::Vae => "vae",
            StageId::Dm => "dm",
        }
    }

    /// Inverse of [`StageId::prefix`].
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "vae" => Some(StageId::Vae),
            "dm" => Some(StageId::Dm),
            _ => None,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A parameter name qualified by the stage that owns it.
///
/// Renders as `"<stage>.<name>"`, the layout used in checkpoint primary state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    /// Owning stage.
    pub stage: StageId,
    /// Bare dotted parameter name.
    pub name: String,
}

impl ParamKey {
    /// Create a key.
    pub fn new(stage: StageId, name: impl Into<String>) -> Self {
        Self {
            stage,
            name: name.into(),
        }
    }

    /// Parse a stage-qualified name. Returns `None` for unknown stages.
    #[must_use]
    pub fn parse(qualified: &str) -> Option<Self> {
        let (prefix, name) = qualified.split_once('.')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(StageId::from_prefix(prefix)?, name))
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage, self.name)
    }
}

/// Outcome of synchronizing one store from another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Number of parameters written.
    pub updated: usize,
    /// Keys present on only one side, or with differing shapes.
    pub skipped: Vec<String>,
}

impl SyncReport {
    /// True when every key was synchronized.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

struct Parameter {
    var: Var,
    requires_grad: bool,
}

/// Mapping from parameter name to tensor, with per-parameter gradient flags.
pub struct ParameterStore {
    params: BTreeMap<String, Parameter>,
    device: Device,
}

impl fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterStore")
            .field("len", &self.params.len())
            .field("trainable", &self.trainable_count())
            .field("device", &self.device)
            .finish()
    }
}

impl ParameterStore {
    /// Create an empty store on `device`.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            params: BTreeMap::new(),
            device: device.clone(),
        }
    }

    /// Adopt every variable of a [`VarMap`] as a trainable parameter.
    ///
    /// The variables are shared, not copied: this is how freshly initialized
    /// models hand their weights over.
    pub fn from_varmap(varmap: &VarMap, device: &Device) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| TrajError::Training("VarMap lock poisoned".into()))?;
        let params = data
            .iter()
            .map(|(name, var)| {
                (
                    name.clone(),
                    Parameter {
                        var: var.clone(),
                        requires_grad: true,
                    },
                )
            })
            .collect();
        Ok(Self {
            params,
            device: device.clone(),
        })
    }

    /// Insert (or replace) a parameter holding a copy of `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: &Tensor, requires_grad: bool) -> Result<()> {
        let var = Var::from_tensor(&value.to_device(&self.device)?)?;
        self.params.insert(name.into(), Parameter { var, requires_grad });
        Ok(())
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the store holds no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Device the parameters live on.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Shape of a parameter.
    #[must_use]
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.params.get(name).map(|p| p.var.dims())
    }

    /// Raw stored value. Carries the variable's graph identity when trainable.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name).map(|p| p.var.as_tensor())
    }

    /// The tensor a model should compute with.
    ///
    /// Trainable parameters are returned attached to the autograd graph;
    /// frozen ones are detached so no gradient can reach them.
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| TrajError::Training(format!("unknown parameter '{name}'")))?;
        Ok(Self::visible(param))
    }

    fn visible(param: &Parameter) -> Tensor {
        if param.requires_grad {
            param.var.as_tensor().clone()
        } else {
            param.var.as_tensor().detach()
        }
    }

    /// Gradient-tracking flag of a parameter.
    #[must_use]
    pub fn requires_grad(&self, name: &str) -> Option<bool> {
        self.params.get(name).map(|p| p.requires_grad)
    }

    /// Set the gradient-tracking flag of every parameter.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        for param in self.params.values_mut() {
            param.requires_grad = requires_grad;
        }
    }

    /// Disable gradients for every parameter.
    pub fn freeze(&mut self) {
        self.set_requires_grad(false);
    }

    /// True when no parameter tracks gradients.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.params.values().all(|p| !p.requires_grad)
    }

    /// Number of gradient-tracking parameters.
    #[must_use]
    pub fn trainable_count(&self) -> usize {
        self.params.values().filter(|p| p.requires_grad).count()
    }

    /// Total number of scalar elements.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.params.values().map(|p| p.var.elem_count()).sum()
    }

    /// Variables the optimizer may update.
    pub fn trainable_vars(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.params
            .iter()
            .filter(|(_, p)| p.requires_grad)
            .map(|(name, p)| (name.as_str(), &p.var))
    }

    /// Overwrite a parameter in place.
    ///
    /// Fails with [`TrajError::ShapeMismatch`] instead of reshaping.
    pub fn assign(&mut self, name: &str, value: &Tensor) -> Result<()> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| TrajError::Training(format!("unknown parameter '{name}'")))?;
        if param.var.dims() != value.dims() {
            return Err(TrajError::ShapeMismatch {
                key: name.to_string(),
                expected: param.var.dims().to_vec(),
                got: value.dims().to_vec(),
            });
        }
        let value = value
            .detach()
            .to_device(&self.device)?
            .to_dtype(param.var.dtype())?;
        param.var.set(&value)?;
        Ok(())
    }

    /// Exact copy of every shared key from `source` (hard reset).
    ///
    /// Keys missing on either side, or with another shape, are skipped and
    /// reported.
    pub fn copy_from(&mut self, source: &ParameterStore) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let names: Vec<String> = self.params.keys().cloned().collect();
        for name in names {
            match source.value(&name) {
                Some(value) if Some(value.dims()) == self.shape(&name) => {
                    let copied = value.detach().copy()?;
                    self.assign(&name, &copied)?;
                    report.updated += 1;
                }
                _ => report.skipped.push(name),
            }
        }
        report.skipped.extend(
            source
                .names()
                .filter(|name| !self.contains(name))
                .map(str::to_string),
        );
        Ok(report)
    }

    /// Independent, gradient-disabled copy with the same key set.
    ///
    /// Nothing is shared with `self`: later updates on either side are not
    /// visible on the other.
    pub fn clone_detached(&self) -> Result<ParameterStore> {
        let mut params = BTreeMap::new();
        for (name, param) in &self.params {
            let var = Var::from_tensor(&param.var.as_tensor().detach().copy()?)?;
            params.insert(
                name.clone(),
                Parameter {
                    var,
                    requires_grad: false,
                },
            );
        }
        Ok(Self {
            params,
            device: self.device.clone(),
        })
    }

    /// Detached snapshot of every value, for serialization.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, Tensor)> {
        self.params
            .iter()
            .map(|(name, p)| (name.clone(), p.var.as_tensor().detach()))
            .collect()
    }

    /// A [`VarBuilder`] over the model-visible tensors.
    ///
    /// `candle_nn` layers built from it read trainable parameters attached to
    /// the graph and frozen parameters detached.
    #[must_use]
    pub fn var_builder(&self) -> VarBuilder<'static> {
        let tensors: HashMap<String, Tensor> = self
            .params
            .iter()
            .map(|(name, p)| (name.clone(), Self::visible(p)))
            .collect();
        VarBuilder::from_tensors(tensors, DType::F32, &self.device)
    }
}

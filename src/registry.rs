//! Shape registry — the static description of a model version's tensor I/O.
//!
//! A streaming separation model is exported with a fixed set of recurrent
//! buffers (convolution history, attention caches, overlap-add state) that
//! are fed in with each chunk and read back out updated. The registry
//! declares, for one model version:
//!
//! - every recurrent buffer's [`BufferRole`], element type, and shape
//! - the engine key each role is fed under and (for recurrent state) the
//!   engine key its updated value comes back under
//! - the key and shape of the audible separated-audio output
//!
//! The role→key table is explicit data, not a string-prefix convention, so
//! the controller stays independent of any particular export's naming and
//! the mapping is testable on its own.
//!
//! Registries are built from a [`RegistryConfig`] (deserializable from the
//! JSON descriptor written next to an exported model) or from the
//! [`waveformer`](ShapeRegistry::waveformer) / [`gridnet`](ShapeRegistry::gridnet)
//! presets.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::store::SessionState;
use crate::{Error, Result};

/// Per-layer recurrent quantity of the grid-attention model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridStateKind {
    KeyCache,
    ValueCache,
    CellState,
    HiddenState,
}

impl GridStateKind {
    /// Short key fragment used by the preset engine-key naming.
    fn key_fragment(self) -> &'static str {
        match self {
            GridStateKind::KeyCache => "k_cache",
            GridStateKind::ValueCache => "v_cache",
            GridStateKind::CellState => "c_state",
            GridStateKind::HiddenState => "h_state",
        }
    }
}

impl fmt::Display for GridStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key_fragment())
    }
}

/// Semantic identity of one tensor slot, independent of engine key names.
///
/// `Mixture` and `Embedding` are inputs only: the engine consumes them but
/// never produces them. Every other role is recurrent state, threaded from
/// one chunk to the next. The number of `GridLayer` entries is a property of
/// the registry, never a constant in the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferRole {
    /// The incoming two-channel audio chunk.
    Mixture,
    /// The enrolled target-speaker embedding. Set by enrollment, not by
    /// per-chunk inference.
    Embedding,
    /// Encoder convolution history.
    ConvHistory,
    /// Decoder (transposed-convolution) history.
    DeconvHistory,
    /// One per-layer recurrent quantity of the grid-attention variant.
    GridLayer { layer: usize, kind: GridStateKind },
    /// Overlap-add synthesis tail.
    OverlapAdd,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRole::Mixture => f.write_str("mixture"),
            BufferRole::Embedding => f.write_str("embedding"),
            BufferRole::ConvHistory => f.write_str("conv_history"),
            BufferRole::DeconvHistory => f.write_str("deconv_history"),
            BufferRole::GridLayer { layer, kind } => write!(f, "grid[{layer}].{kind}"),
            BufferRole::OverlapAdd => f.write_str("overlap_add"),
        }
    }
}

/// Declared dtype, shape, and engine keys for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
    /// Key this role is fed to the engine under.
    pub input_key: String,
    /// Key the updated value comes back under. `None` for roles the engine
    /// only consumes (`Mixture`, `Embedding`).
    pub output_key: Option<String>,
}

/// One role entry of a [`RegistryConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDecl {
    pub role: BufferRole,
    pub shape: Vec<usize>,
    pub input_key: String,
    #[serde(default)]
    pub output_key: Option<String>,
}

/// Serializable registry descriptor.
///
/// Matches the JSON sidecar written at model-export time, so a session can
/// be configured from the same file that describes the exported model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub roles: Vec<RoleDecl>,
    /// Engine key of the audible separated-audio output.
    pub audible_key: String,
    /// Shape of the audible output chunk.
    pub audible_shape: Vec<usize>,
}

/// Shapes for the [`gridnet`](ShapeRegistry::gridnet) preset. Per-layer
/// shapes are shared across layers.
#[derive(Debug, Clone)]
pub struct GridnetShapes {
    pub mixture: Vec<usize>,
    pub embedding: Vec<usize>,
    pub conv_history: Vec<usize>,
    pub deconv_history: Vec<usize>,
    pub key_cache: Vec<usize>,
    pub value_cache: Vec<usize>,
    pub cell_state: Vec<usize>,
    pub hidden_state: Vec<usize>,
    pub overlap_add: Vec<usize>,
    pub audible: Vec<usize>,
}

/// Static description of every tensor a model version reads and writes.
///
/// Pure and stateless once constructed: used to zero-initialize sessions and
/// to validate engine outputs before they are committed.
#[derive(Debug, Clone)]
pub struct ShapeRegistry {
    entries: BTreeMap<BufferRole, RoleSpec>,
    audible_key: String,
    audible_shape: Vec<usize>,
}

impl ShapeRegistry {
    /// Build a registry from a descriptor, validating it is internally
    /// consistent: `Mixture` and `Embedding` present and input-only, every
    /// other role recurrent, all dimensions positive, engine keys unique.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut input_keys = HashSet::new();
        let mut output_keys = HashSet::new();

        for decl in config.roles {
            check_shape(&decl.shape, &decl.role.to_string())?;
            let input_only = matches!(decl.role, BufferRole::Mixture | BufferRole::Embedding);
            if input_only && decl.output_key.is_some() {
                return Err(Error::Config(format!(
                    "role {} is input-only and must not declare an output key",
                    decl.role
                )));
            }
            if !input_only && decl.output_key.is_none() {
                return Err(Error::Config(format!(
                    "recurrent role {} must declare an output key",
                    decl.role
                )));
            }
            if !input_keys.insert(decl.input_key.clone()) {
                return Err(Error::Config(format!(
                    "duplicate engine input key `{}`",
                    decl.input_key
                )));
            }
            if let Some(key) = &decl.output_key {
                if !output_keys.insert(key.clone()) {
                    return Err(Error::Config(format!("duplicate engine output key `{key}`")));
                }
            }
            let spec = RoleSpec {
                dtype: DType::F32,
                shape: decl.shape,
                input_key: decl.input_key,
                output_key: decl.output_key,
            };
            if entries.insert(decl.role, spec).is_some() {
                return Err(Error::Config(format!("duplicate role {}", decl.role)));
            }
        }

        for required in [BufferRole::Mixture, BufferRole::Embedding] {
            if !entries.contains_key(&required) {
                return Err(Error::Config(format!("registry is missing the {required} role")));
            }
        }
        check_shape(&config.audible_shape, "audible output")?;
        if !output_keys.insert(config.audible_key.clone()) {
            return Err(Error::Config(format!(
                "audible output key `{}` collides with a state output key",
                config.audible_key
            )));
        }

        Ok(Self {
            entries,
            audible_key: config.audible_key,
            audible_shape: config.audible_shape,
        })
    }

    /// Parse a registry from its JSON descriptor.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        Self::new(config)
    }

    /// Load a registry from the JSON descriptor written at model export.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// The dilated-convolution model layout: encoder/decoder convolution
    /// histories plus an overlap-add tail, with the export's `x` / `label` /
    /// `init_*` input keys and `filtered` audible output.
    pub fn waveformer(
        mixture: &[usize],
        embedding: &[usize],
        enc_buf: &[usize],
        dec_buf: &[usize],
        out_buf: &[usize],
        audible: &[usize],
    ) -> Result<Self> {
        Self::new(RegistryConfig {
            roles: vec![
                decl(BufferRole::Mixture, mixture, "x", None),
                decl(BufferRole::Embedding, embedding, "label", None),
                decl(BufferRole::ConvHistory, enc_buf, "init_enc_buf", Some("enc_buf")),
                decl(BufferRole::DeconvHistory, dec_buf, "init_dec_buf", Some("dec_buf")),
                decl(BufferRole::OverlapAdd, out_buf, "init_out_buf", Some("out_buf")),
            ],
            audible_key: "filtered".to_string(),
            audible_shape: audible.to_vec(),
        })
    }

    /// The grid-attention model layout: per-layer key/value caches and
    /// recurrent cell/hidden state, `num_layers` taken as a parameter.
    pub fn gridnet(num_layers: usize, shapes: GridnetShapes) -> Result<Self> {
        let mut roles = vec![
            decl(BufferRole::Mixture, &shapes.mixture, "x", None),
            decl(BufferRole::Embedding, &shapes.embedding, "label", None),
            decl(
                BufferRole::ConvHistory,
                &shapes.conv_history,
                "init_conv_buf",
                Some("conv_buf"),
            ),
            decl(
                BufferRole::DeconvHistory,
                &shapes.deconv_history,
                "init_deconv_buf",
                Some("deconv_buf"),
            ),
            decl(
                BufferRole::OverlapAdd,
                &shapes.overlap_add,
                "init_ola_buf",
                Some("ola_buf"),
            ),
        ];
        for layer in 0..num_layers {
            for (kind, shape) in [
                (GridStateKind::KeyCache, &shapes.key_cache),
                (GridStateKind::ValueCache, &shapes.value_cache),
                (GridStateKind::CellState, &shapes.cell_state),
                (GridStateKind::HiddenState, &shapes.hidden_state),
            ] {
                let fragment = kind.key_fragment();
                let input_key = format!("init_{fragment}_{layer}");
                let output_key = format!("{fragment}_{layer}");
                roles.push(decl(
                    BufferRole::GridLayer { layer, kind },
                    shape,
                    &input_key,
                    Some(output_key.as_str()),
                ));
            }
        }
        Self::new(RegistryConfig {
            roles,
            audible_key: "filtered".to_string(),
            audible_shape: shapes.audible,
        })
    }

    /// Iterate every declared role and its spec, in deterministic order.
    pub fn shapes(&self) -> impl Iterator<Item = (BufferRole, &RoleSpec)> + '_ {
        self.entries.iter().map(|(role, spec)| (*role, spec))
    }

    /// Roles the engine produces a next-state output for.
    pub fn state_roles(&self) -> impl Iterator<Item = BufferRole> + '_ {
        self.entries
            .iter()
            .filter(|(_, spec)| spec.output_key.is_some())
            .map(|(role, _)| *role)
    }

    /// Spec for one role, [`Error::UnknownRole`] if undeclared.
    pub fn spec(&self, role: BufferRole) -> Result<&RoleSpec> {
        self.entries.get(&role).ok_or(Error::UnknownRole(role))
    }

    pub fn contains(&self, role: BufferRole) -> bool {
        self.entries.contains_key(&role)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Engine key of the audible separated-audio output.
    pub fn audible_key(&self) -> &str {
        &self.audible_key
    }

    /// Shape of the audible separated-audio output.
    pub fn audible_shape(&self) -> &[usize] {
        &self.audible_shape
    }

    /// Fresh zero-valued state for every declared role.
    pub fn defaults(&self) -> Result<SessionState> {
        let mut state = SessionState::new();
        for (role, spec) in self.shapes() {
            let zeros = Tensor::zeros(spec.shape.as_slice(), spec.dtype, &Device::Cpu)?;
            state.insert(role, zeros);
        }
        Ok(state)
    }

    /// Check a tensor against one role's declared dtype and shape.
    pub fn validate(&self, role: BufferRole, tensor: &Tensor) -> Result<()> {
        let spec = self.spec(role)?;
        check_tensor(tensor, spec.dtype, &spec.shape, &role.to_string())
    }

    /// Check a tensor against the audible output's declared shape.
    pub fn validate_audible(&self, tensor: &Tensor) -> Result<()> {
        check_tensor(tensor, DType::F32, &self.audible_shape, "audible output")
    }
}

fn decl(role: BufferRole, shape: &[usize], input_key: &str, output_key: Option<&str>) -> RoleDecl {
    RoleDecl {
        role,
        shape: shape.to_vec(),
        input_key: input_key.to_string(),
        output_key: output_key.map(str::to_string),
    }
}

fn check_shape(shape: &[usize], context: &str) -> Result<()> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(Error::Config(format!(
            "{context} has invalid shape {shape:?}: dimensions must be positive"
        )));
    }
    Ok(())
}

fn check_tensor(tensor: &Tensor, dtype: DType, shape: &[usize], context: &str) -> Result<()> {
    if tensor.dtype() != dtype {
        return Err(Error::DtypeMismatch {
            context: context.to_string(),
            expected: dtype,
            got: tensor.dtype(),
        });
    }
    if tensor.dims() != shape {
        return Err(Error::ShapeMismatch {
            context: context.to_string(),
            expected: shape.to_vec(),
            got: tensor.dims().to_vec(),
        });
    }
    Ok(())
}

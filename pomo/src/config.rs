// src/config.rs
//
// Construction-time configuration for the policy, the augmentation layer and
// the rollout loop.
//
// All values are validated before any component is built; invalid
// combinations fail immediately instead of at the first forward call.
//
// Sources, highest precedence first:
// 1. Explicit struct values / CLI flags
// 2. POMO_* environment variables (see `RunConfig::apply_env_overrides`)
// 3. YAML file (`RunConfig::from_yaml_file`)
// 4. Defaults

use std::env;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::augmentation::{AugmentFn, DIHEDRAL_ORDER};
use crate::error::{PomoError, Result};

/// Normalization applied inside each encoder layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    #[default]
    Batch,
    Instance,
    Layer,
    None,
}

impl Normalization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Normalization::Batch => "batch",
            Normalization::Instance => "instance",
            Normalization::Layer => "layer",
            Normalization::None => "none",
        }
    }

    /// Parse a normalization name (case-insensitive).
    pub fn parse(s: &str) -> Result<Normalization> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(Normalization::Batch),
            "instance" => Ok(Normalization::Instance),
            "layer" => Ok(Normalization::Layer),
            "none" | "" => Ok(Normalization::None),
            other => Err(PomoError::config(
                "normalization",
                format!("unknown normalization '{other}' (expected batch|instance|layer|none)"),
            )),
        }
    }
}

/// Policy architecture and multi-start settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Width of node embeddings and encoder outputs.
    pub embedding_dim: usize,
    /// Hidden width of the encoder feed-forward sublayer.
    pub hidden_dim: usize,
    /// Attention heads (encoder and decoder glimpse).
    pub n_heads: usize,
    /// Number of encoder layers.
    pub n_encode_layers: usize,
    pub normalization: Normalization,
    /// Multi-start replicas per instance (P).
    pub num_pomo: usize,
    /// Exclude infeasible nodes from the decoder glimpse attention.
    pub mask_inner: bool,
    /// Request a fused attention kernel. There is none on this backend, the
    /// flag is accepted for config compatibility.
    pub force_flash_attn: bool,
    /// Logit clipping constant C in `C * tanh(logits)`. 0 disables clipping.
    pub tanh_clipping: f32,
    /// Seed for parameter initialisation.
    pub init_seed: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 128,
            hidden_dim: 512,
            n_heads: 8,
            n_encode_layers: 3,
            normalization: Normalization::Batch,
            num_pomo: 10,
            mask_inner: true,
            force_flash_attn: false,
            tanh_clipping: 10.0,
            init_seed: 1234,
        }
    }
}

impl PolicyConfig {
    /// A small network for tests and quick CLI runs.
    pub fn small() -> Self {
        Self {
            embedding_dim: 16,
            hidden_dim: 32,
            n_heads: 2,
            n_encode_layers: 1,
            ..Self::default()
        }
    }

    pub fn with_num_pomo(mut self, num_pomo: usize) -> Self {
        self.num_pomo = num_pomo;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding_dim == 0 {
            return Err(PomoError::config("embedding_dim", "must be >= 1"));
        }
        if self.hidden_dim == 0 {
            return Err(PomoError::config("hidden_dim", "must be >= 1"));
        }
        if self.n_heads == 0 {
            return Err(PomoError::config("n_heads", "must be >= 1"));
        }
        if self.embedding_dim % self.n_heads != 0 {
            return Err(PomoError::config(
                "n_heads",
                format!(
                    "embedding_dim {} is not divisible by n_heads {}",
                    self.embedding_dim, self.n_heads
                ),
            ));
        }
        if self.num_pomo == 0 {
            return Err(PomoError::config("num_pomo", "must be >= 1"));
        }
        if !self.tanh_clipping.is_finite() || self.tanh_clipping < 0.0 {
            return Err(PomoError::config(
                "tanh_clipping",
                "must be a finite value >= 0",
            ));
        }
        Ok(())
    }

    /// Per-head key/value width.
    pub fn head_dim(&self) -> usize {
        self.embedding_dim / self.n_heads
    }
}

/// Augmentation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Number of augmented copies per instance (A).
    pub num_augment: usize,
    /// Transform name: "dihedral8" or "symmetric".
    pub augment_fn: String,
    /// Force replica 0 of every augmentation group to the exact original.
    pub first_aug_identity: bool,
    /// Global min-max rescaling of augmented features to [0, 1].
    pub normalize: bool,
    /// Features to augment. `None` means `["locs"]`.
    pub feats: Option<Vec<String>>,
    /// Rotation centre for the symmetric transform.
    pub offset: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            num_augment: 8,
            augment_fn: "symmetric".to_string(),
            first_aug_identity: true,
            normalize: false,
            feats: None,
            offset: 0.5,
        }
    }
}

impl AugmentationConfig {
    pub fn dihedral8() -> Self {
        Self {
            augment_fn: "dihedral8".to_string(),
            ..Self::default()
        }
    }

    pub fn symmetric(num_augment: usize) -> Self {
        Self {
            num_augment,
            ..Self::default()
        }
    }

    /// Full check: structure, a known `augment_fn`, and its copy count.
    pub fn validate(&self) -> Result<()> {
        self.validate_structure()?;
        let augment_fn = AugmentFn::parse(&self.augment_fn)?;
        if augment_fn == AugmentFn::Dihedral8 && self.num_augment != DIHEDRAL_ORDER {
            return Err(PomoError::config(
                "num_augment",
                format!(
                    "the `dihedral8` augmentation requires num_augment == {DIHEDRAL_ORDER}, got {}",
                    self.num_augment
                ),
            ));
        }
        Ok(())
    }

    /// Checks that hold for any transform, including caller-supplied ones.
    pub fn validate_structure(&self) -> Result<()> {
        if self.num_augment == 0 {
            return Err(PomoError::config("num_augment", "must be >= 1"));
        }
        if let Some(feats) = &self.feats {
            if feats.is_empty() {
                return Err(PomoError::config("feats", "feature list cannot be empty"));
            }
        }
        if !self.offset.is_finite() {
            return Err(PomoError::config("offset", "must be finite"));
        }
        Ok(())
    }
}

/// Rollout loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// "sampling" or "greedy".
    pub decode_type: String,
    /// Hard cap on decode steps. `None` uses the environment's step limit.
    pub max_decode_steps: Option<usize>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            decode_type: "sampling".to_string(),
            max_decode_steps: None,
        }
    }
}

impl RolloutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_decode_steps == Some(0) {
            return Err(PomoError::config("max_decode_steps", "must be >= 1"));
        }
        crate::decoder::DecodeType::parse(&self.decode_type).map(|_| ())
    }
}

/// Everything a run needs, loadable from one YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub policy: PolicyConfig,
    /// `None` disables augmentation.
    pub augmentation: Option<AugmentationConfig>,
    pub rollout: RolloutConfig,
}

impl RunConfig {
    /// Load and validate a run config from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| PomoError::ConfigIo {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate a run config from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: RunConfig = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if let Some(aug) = &self.augmentation {
            aug.validate()?;
        }
        self.rollout.validate()
    }

    /// Apply POMO_* environment variable overrides.
    ///
    /// Recognised: POMO_NUM_POMO, POMO_NUM_AUGMENT, POMO_DECODE_TYPE,
    /// POMO_MAX_DECODE_STEPS, POMO_INIT_SEED. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Override hook with an injectable lookup (keeps tests off the process env).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("POMO_NUM_POMO") {
            match raw.trim().parse::<usize>() {
                Ok(v) => {
                    info!("[config] POMO_NUM_POMO = {v} (overrode {})", self.policy.num_pomo);
                    self.policy.num_pomo = v;
                }
                Err(_) => warn!("[config] could not parse POMO_NUM_POMO = {raw:?} as usize; ignoring"),
            }
        }

        if let Some(raw) = lookup("POMO_NUM_AUGMENT") {
            match raw.trim().parse::<usize>() {
                Ok(v) => {
                    let aug = self.augmentation.get_or_insert_with(AugmentationConfig::default);
                    info!("[config] POMO_NUM_AUGMENT = {v} (overrode {})", aug.num_augment);
                    aug.num_augment = v;
                }
                Err(_) => {
                    warn!("[config] could not parse POMO_NUM_AUGMENT = {raw:?} as usize; ignoring")
                }
            }
        }

        if let Some(raw) = lookup("POMO_DECODE_TYPE") {
            let v = raw.trim().to_ascii_lowercase();
            info!("[config] POMO_DECODE_TYPE = {v} (overrode {})", self.rollout.decode_type);
            self.rollout.decode_type = v;
        }

        if let Some(raw) = lookup("POMO_MAX_DECODE_STEPS") {
            match raw.trim().parse::<usize>() {
                Ok(v) => {
                    info!(
                        "[config] POMO_MAX_DECODE_STEPS = {v} (overrode {:?})",
                        self.rollout.max_decode_steps
                    );
                    self.rollout.max_decode_steps = Some(v);
                }
                Err(_) => warn!(
                    "[config] could not parse POMO_MAX_DECODE_STEPS = {raw:?} as usize; ignoring"
                ),
            }
        }

        if let Some(raw) = lookup("POMO_INIT_SEED") {
            match raw.trim().parse::<u64>() {
                Ok(v) => {
                    info!("[config] POMO_INIT_SEED = {v} (overrode {})", self.policy.init_seed);
                    self.policy.init_seed = v;
                }
                Err(_) => warn!("[config] could not parse POMO_INIT_SEED = {raw:?} as u64; ignoring"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_policy_config_is_valid() {
        let cfg = PolicyConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.head_dim(), 16);
        assert!(PolicyConfig::small().validate().is_ok());
    }

    #[test]
    fn test_heads_must_divide_embedding_dim() {
        let cfg = PolicyConfig {
            embedding_dim: 10,
            n_heads: 3,
            ..PolicyConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("n_heads"));
    }

    #[test]
    fn test_zero_pomo_rejected() {
        let cfg = PolicyConfig::default().with_num_pomo(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_normalization_parse() {
        assert_eq!(Normalization::parse("Batch").unwrap(), Normalization::Batch);
        assert_eq!(Normalization::parse("layer").unwrap(), Normalization::Layer);
        assert_eq!(Normalization::parse("none").unwrap(), Normalization::None);
        assert!(Normalization::parse("group").is_err());
    }

    #[test]
    fn test_augmentation_config_rejects_empty_feats() {
        let cfg = AugmentationConfig {
            feats: Some(vec![]),
            ..AugmentationConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = AugmentationConfig {
            num_augment: 0,
            ..AugmentationConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rollout_config_rejects_unknown_decode_type() {
        let cfg = RolloutConfig {
            decode_type: "beam".to_string(),
            max_decode_steps: None,
        };
        assert!(cfg.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_parse_run_config_yaml() {
        let yaml = r#"
policy:
  embedding_dim: 32
  n_heads: 4
  num_pomo: 20
  normalization: instance
augmentation:
  augment_fn: dihedral8
  num_augment: 8
rollout:
  decode_type: greedy
"#;
        let cfg = RunConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.policy.embedding_dim, 32);
        assert_eq!(cfg.policy.num_pomo, 20);
        assert_eq!(cfg.policy.normalization, Normalization::Instance);
        // unspecified fields keep their defaults
        assert_eq!(cfg.policy.hidden_dim, 512);
        let aug = cfg.augmentation.unwrap();
        assert_eq!(aug.augment_fn, "dihedral8");
        assert!(aug.first_aug_identity);
        assert_eq!(cfg.rollout.decode_type, "greedy");
    }

    #[test]
    fn test_invalid_yaml_value_fails_validation() {
        let yaml = "policy:\n  embedding_dim: 0\n";
        assert!(RunConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("POMO_NUM_POMO", "16"),
            ("POMO_NUM_AUGMENT", "4"),
            ("POMO_DECODE_TYPE", "Greedy"),
            ("POMO_INIT_SEED", "not-a-number"),
            ("POMO_MAX_DECODE_STEPS", "40"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RunConfig::default();
        cfg.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.policy.num_pomo, 16);
        assert_eq!(cfg.augmentation.as_ref().unwrap().num_augment, 4);
        assert_eq!(cfg.rollout.decode_type, "greedy");
        assert_eq!(cfg.rollout.max_decode_steps, Some(40));
        // bad value ignored
        assert_eq!(cfg.policy.init_seed, PolicyConfig::default().init_seed);

        cfg.apply_overrides_from(|k| (k == "POMO_INIT_SEED").then(|| "99".to_string()));
        assert_eq!(cfg.policy.init_seed, 99);
    }
}

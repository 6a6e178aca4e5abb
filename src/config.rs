/// Configuration for the reference network, the margin loss and the
/// criterion-side optimizer.
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Reference late-fusion network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Token vocabulary size
    pub vocab_size: usize,

    /// Token embedding dimension
    pub text_dim: usize,

    /// Audio feature dimension (last axis of the audio tensor)
    pub audio_dim: usize,

    /// Fused feature dimension, also the embedding fed to margin losses
    pub hidden_size: usize,

    /// Number of emotion classes
    pub num_classes: usize,

    /// Dropout probability applied to the fused features in train mode
    pub dropout: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30522, // BERT-base vocabulary
            text_dim: 128,
            audio_dim: 128,
            hidden_size: 256,
            num_classes: 4,
            dropout: 0.1,
        }
    }
}

impl FusionConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.vocab_size == 0 || self.text_dim == 0 || self.audio_dim == 0 {
            return Err(crate::TrainError::Config(
                "vocab_size, text_dim and audio_dim must be > 0".to_string(),
            ));
        }

        if self.hidden_size == 0 {
            return Err(crate::TrainError::Config(
                "hidden_size must be > 0".to_string(),
            ));
        }

        if self.num_classes < 2 {
            return Err(crate::TrainError::Config(format!(
                "num_classes must be >= 2, got {}",
                self.num_classes
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(crate::TrainError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }

        Ok(())
    }
}

/// Combined angular/cosine margin loss configuration
///
/// Target logit is `s * (cos(theta + m2) - m3)`, every other class keeps
/// `s * cos(theta)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginLossConfig {
    /// Dimension of the incoming embedding
    pub embedding_dim: usize,

    /// Number of classes (rows of the learnable weight matrix)
    pub num_classes: usize,

    /// Logit scale `s`
    pub scale: f64,

    /// Additive angular margin `m2`
    pub angular_margin: f64,

    /// Additive cosine margin `m3`
    pub cosine_margin: f64,
}

impl Default for MarginLossConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 256,
            num_classes: 4,
            scale: 64.0,
            angular_margin: 0.5,
            cosine_margin: 0.0,
        }
    }
}

impl MarginLossConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.embedding_dim == 0 || self.num_classes < 2 {
            return Err(crate::TrainError::Config(
                "embedding_dim must be > 0 and num_classes >= 2".to_string(),
            ));
        }

        if self.scale <= 0.0 {
            return Err(crate::TrainError::Config(format!(
                "scale must be > 0, got {}",
                self.scale
            )));
        }

        if !(0.0..std::f64::consts::FRAC_PI_2).contains(&self.angular_margin) {
            return Err(crate::TrainError::Config(format!(
                "angular_margin must be in [0, pi/2), got {}",
                self.angular_margin
            )));
        }

        if self.cosine_margin < 0.0 {
            return Err(crate::TrainError::Config(format!(
                "cosine_margin must be >= 0, got {}",
                self.cosine_margin
            )));
        }

        Ok(())
    }
}

/// Optimizer and schedule for the margin loss parameters
///
/// Defaults were tuned for the scale of normalized class centers and are
/// independent of whatever the network optimizer uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginOptimConfig {
    /// Base learning rate
    pub learning_rate: f64,

    /// SGD momentum
    pub momentum: f64,

    /// L2 weight decay
    pub weight_decay: f64,

    /// 1-indexed epochs at which the rate is multiplied by `gamma`
    pub milestones: Vec<usize>,

    /// Decay factor per milestone
    pub gamma: f64,
}

impl Default for MarginOptimConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 5e-4,
            milestones: vec![8, 14, 20, 25],
            gamma: 0.1,
        }
    }
}

impl MarginOptimConfig {
    /// Load from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(crate::TrainError::Config(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }

        if !(0.0..1.0).contains(&self.momentum) {
            return Err(crate::TrainError::Config(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }

        if self.weight_decay < 0.0 {
            return Err(crate::TrainError::Config(
                "weight_decay must be >= 0".to_string(),
            ));
        }

        if self.gamma <= 0.0 || self.gamma > 1.0 {
            return Err(crate::TrainError::Config(format!(
                "gamma must be in (0, 1], got {}",
                self.gamma
            )));
        }

        if self.milestones.contains(&0) || self.milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(crate::TrainError::Config(format!(
                "milestones must be strictly increasing 1-indexed epochs, got {:?}",
                self.milestones
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(FusionConfig::default().validate().is_ok());
        assert!(MarginLossConfig::default().validate().is_ok());
        assert!(MarginOptimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_margin_optim_defaults() {
        let config = MarginOptimConfig::default();
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.momentum, 0.9);
        assert_eq!(config.weight_decay, 5e-4);
        assert_eq!(config.milestones, vec![8, 14, 20, 25]);
    }

    #[test]
    fn test_unsorted_milestones_rejected() {
        let config = MarginOptimConfig {
            milestones: vec![14, 8],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(crate::TrainError::Config(_))));
    }

    #[test]
    fn test_from_json_file() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("margin.json");
        std::fs::write(
            &path,
            r#"{"learning_rate":0.05,"momentum":0.8,"weight_decay":0.0,"milestones":[3,6],"gamma":0.5}"#,
        )?;

        let config = MarginOptimConfig::from_json_file(&path)?;
        assert_eq!(config.learning_rate, 0.05);
        assert_eq!(config.milestones, vec![3, 6]);

        Ok(())
    }

    #[test]
    fn test_fusion_dropout_range() {
        let config = FusionConfig {
            dropout: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

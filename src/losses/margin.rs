/// Combined additive angular / cosine margin loss
///
/// Class centers are a learnable `[num_classes, embedding_dim]` matrix. Both
/// centers and embeddings are L2-normalised, so logits are scaled cosines.
/// The target class gets `cos(theta + m2) - m3` before scaling, which pushes
/// same-class embeddings together harder than plain softmax.
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Init, VarBuilder, VarMap};

use super::MarginLoss;
use crate::config::MarginLossConfig;
use crate::TrainError;

const COS_CLAMP: f64 = 1.0 - 1e-7;
const NORM_EPS: f64 = 1e-12;

pub struct CombinedMarginLoss {
    config: MarginLossConfig,
    varmap: VarMap,
    weight: Tensor,
    cos_m: f64,
    sin_m: f64,
    // past theta = pi - m2, cos(theta + m2) stops being monotonic
    threshold: f64,
    fallback: f64,
}

impl CombinedMarginLoss {
    pub fn new(config: MarginLossConfig, device: &Device) -> crate::Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let weight = vb.get_with_hints(
            (config.num_classes, config.embedding_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 0.01,
            },
        )?;

        let m = config.angular_margin;
        Ok(Self {
            cos_m: m.cos(),
            sin_m: m.sin(),
            threshold: (std::f64::consts::PI - m).cos(),
            fallback: (std::f64::consts::PI - m).sin() * m,
            config,
            varmap,
            weight,
        })
    }

    pub fn config(&self) -> &MarginLossConfig {
        &self.config
    }

    /// Cosine similarity between every embedding and every class center
    pub fn cosine(&self, embedding: &Tensor) -> crate::Result<Tensor> {
        if embedding.rank() != 2 || embedding.dim(1)? != self.config.embedding_dim {
            return Err(TrainError::Contract(format!(
                "margin loss expects [batch, {}] embeddings, got {:?}",
                self.config.embedding_dim,
                embedding.dims()
            )));
        }

        let embedding = l2_normalize(embedding)?;
        let centers = l2_normalize(&self.weight)?;
        Ok(embedding.matmul(&centers.t()?)?.clamp(-COS_CLAMP, COS_CLAMP)?)
    }

    fn target_cosine(&self, cos: &Tensor) -> crate::Result<Tensor> {
        let mut target = cos.clone();

        if self.config.angular_margin > 0.0 {
            // cos(theta + m) = cos(theta) cos(m) - sin(theta) sin(m)
            let sin = cos.sqr()?.affine(-1.0, 1.0)?.sqrt()?;
            let shifted = (cos.affine(self.cos_m, 0.0)? - sin.affine(self.sin_m, 0.0)?)?;
            let linear = cos.affine(1.0, -self.fallback)?;
            target = cos.gt(self.threshold)?.where_cond(&shifted, &linear)?;
        }

        if self.config.cosine_margin > 0.0 {
            target = target.affine(1.0, -self.config.cosine_margin)?;
        }

        Ok(target)
    }
}

impl MarginLoss for CombinedMarginLoss {
    fn forward(&self, embedding: &Tensor, labels: &Tensor) -> crate::Result<(Tensor, Tensor)> {
        let cos = self.cosine(embedding)?;
        let num_classes = self.config.num_classes;

        let classes = Tensor::arange(0u32, num_classes as u32, cos.device())?.unsqueeze(0)?;
        let is_target = labels.unsqueeze(1)?.broadcast_eq(&classes)?;

        let target = self.target_cosine(&cos)?;
        let margin_logits = is_target
            .where_cond(&target, &cos)?
            .affine(self.config.scale, 0.0)?;
        let loss = candle_nn::loss::cross_entropy(&margin_logits, labels)?;

        let logits = cos.affine(self.config.scale, 0.0)?;

        Ok((loss, logits))
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

fn l2_normalize(x: &Tensor) -> candle_core::Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.affine(1.0, NORM_EPS)?.sqrt()?;
    x.broadcast_div(&norm)
}

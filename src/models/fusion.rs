/// Late-fusion text + audio classifier
///
/// Small reference network: mean-pooled token embeddings and (frame-pooled)
/// audio features are projected, concatenated and fused into the embedding
/// that margin losses consume; a linear head produces the logits.
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};

use super::{Network, NetworkOutput};
use crate::config::FusionConfig;
use crate::TrainError;

pub struct FusionClassifier {
    config: FusionConfig,
    varmap: VarMap,
    embed_tokens: Embedding,
    audio_proj: Linear,
    fusion: Linear,
    head: Linear,
}

impl FusionClassifier {
    /// Create a new classifier with freshly initialised parameters on `device`
    pub fn new(config: FusionConfig, device: &Device) -> crate::Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embed_tokens = candle_nn::embedding(config.vocab_size, config.text_dim, vb.pp("embed_tokens"))?;
        let audio_proj = candle_nn::linear(config.audio_dim, config.text_dim, vb.pp("audio_proj"))?;
        let fusion = candle_nn::linear(config.text_dim * 2, config.hidden_size, vb.pp("fusion"))?;
        let head = candle_nn::linear(config.hidden_size, config.num_classes, vb.pp("head"))?;

        Ok(Self {
            config,
            varmap,
            embed_tokens,
            audio_proj,
            fusion,
            head,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    fn encode_audio(&self, audio: &Tensor) -> crate::Result<Tensor> {
        // [batch, frames, features] is averaged over frames
        let pooled = match audio.rank() {
            2 => audio.clone(),
            3 => audio.mean(1)?,
            _ => {
                return Err(TrainError::Contract(format!(
                    "audio must be [batch, features] or [batch, frames, features], got {:?}",
                    audio.dims()
                )))
            }
        };
        let pooled = pooled.to_dtype(DType::F32)?;
        Ok(self.audio_proj.forward(&pooled)?)
    }
}

impl Network for FusionClassifier {
    fn forward_t(&self, input_ids: &Tensor, audio: &Tensor, train: bool) -> crate::Result<NetworkOutput> {
        if input_ids.rank() != 2 {
            return Err(TrainError::Contract(format!(
                "input_ids must be [batch, seq_len], got {:?}",
                input_ids.dims()
            )));
        }

        let text = self.embed_tokens.forward(input_ids)?.mean(1)?;
        let audio = self.encode_audio(audio)?;

        let fused = Tensor::cat(&[&text, &audio], 1)?;
        let mut embedding = self.fusion.forward(&fused)?.relu()?;
        if train && self.config.dropout > 0.0 {
            embedding = candle_nn::ops::dropout(&embedding, self.config.dropout)?;
        }

        let logits = self.head.forward(&embedding)?;

        Ok(NetworkOutput::new(logits, embedding))
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

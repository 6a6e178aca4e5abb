/// Joint margin training on a synthetic batch, with a checkpoint round trip
use candle_core::{Device, Tensor};
use mmser_trainer::losses::CombinedMarginLoss;
use mmser_trainer::training::{AdamW, AdamWConfig, CosineScheduler, CosineSchedulerConfig};
use mmser_trainer::utils::named_parameters;
use mmser_trainer::{
    Batch, Criterion, FusionClassifier, FusionConfig, JointMarginTrainer, MarginLossConfig, MarginOptimConfig,
    Network, StepTrainer,
};

const NUM_EPOCHS: usize = 12;
const STEPS_PER_EPOCH: usize = 4;

fn build_trainer(device: &Device) -> anyhow::Result<JointMarginTrainer<FusionClassifier>> {
    let network = FusionClassifier::new(
        FusionConfig {
            vocab_size: 64,
            text_dim: 16,
            audio_dim: 10,
            hidden_size: 32,
            num_classes: 4,
            dropout: 0.1,
        },
        device,
    )?;
    let criterion = CombinedMarginLoss::new(
        MarginLossConfig {
            embedding_dim: 32,
            num_classes: 4,
            scale: 16.0,
            angular_margin: 0.3,
            cosine_margin: 0.0,
        },
        device,
    )?;
    let optimizer = AdamW::new(
        named_parameters(network.varmap())?,
        AdamWConfig {
            lr: 3e-3,
            ..Default::default()
        },
    )?;
    let scheduler = CosineScheduler::new(CosineSchedulerConfig {
        lr_init: 3e-3,
        lr_min: 1e-4,
        warmup_epochs: 1,
        total_epochs: NUM_EPOCHS,
    });

    let trainer = JointMarginTrainer::new(
        network,
        Criterion::Margin(Box::new(criterion)),
        Box::new(optimizer),
        device.clone(),
        MarginOptimConfig::default(),
    )?
    .with_scheduler(Box::new(scheduler));
    Ok(trainer)
}

fn synthetic_batch(device: &Device) -> anyhow::Result<Batch> {
    let input_ids = Tensor::rand(0f32, 64.0, (16, 12), device)?.to_dtype(candle_core::DType::U32)?;
    let audio = Tensor::randn(0f32, 1.0, (16, 20, 10), device)?;
    let labels: Vec<u32> = (0..16).map(|i| i % 4).collect();
    let label = Tensor::new(labels.as_slice(), device)?;
    Ok(Batch::new(input_ids, audio, label)?)
}

fn run_epochs(
    trainer: &mut JointMarginTrainer<FusionClassifier>,
    batch: &Batch,
    epochs: std::ops::RangeInclusive<usize>,
) -> anyhow::Result<()> {
    for epoch in epochs {
        let mut loss = 0.0;
        for _ in 0..STEPS_PER_EPOCH {
            loss += trainer.train_step(batch)?.loss;
        }
        let eval = trainer.test_step(batch)?;
        log::info!(
            "epoch {:>2}: train_loss={:.4} test_loss={:.4} test_acc={:.3} criterion_lr={:.6}",
            epoch,
            loss / STEPS_PER_EPOCH as f32,
            eval.loss,
            eval.acc,
            trainer.criterion_optimizer().config().lr
        );
        trainer.lr_scheduler(trainer.global_step(), epoch)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let batch = synthetic_batch(&device)?;
    let checkpoint_dir = tempfile::tempdir()?;

    let half = NUM_EPOCHS / 2;
    let mut trainer = build_trainer(&device)?;
    run_epochs(&mut trainer, &batch, 1..=half)?;
    let path = trainer.save_all_states(checkpoint_dir.path(), half, trainer.global_step())?;

    let mut resumed = build_trainer(&device)?;
    resumed.load_all_states(&path, &device)?;
    let start = resumed.start_epoch() + 1;
    run_epochs(&mut resumed, &batch, start..=NUM_EPOCHS)?;

    let final_metrics = resumed.test_step(&batch)?;
    log::info!("final: {}", serde_json::to_string(&final_metrics)?);

    Ok(())
}

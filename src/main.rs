use anyhow::{Context, Result};
use clap::Parser;
use masktrack_eval::config::{EvalConfig, Normalization, SeedingPolicy, UndefinedIouPolicy};
use masktrack_eval::error::ModelError;
use masktrack_eval::output::{PngFrameDump, PredictionSink};
use masktrack_eval::segmentation;
use masktrack_eval::source::{DavisSource, SequenceSource};
use masktrack_eval::{EvaluationAggregator, SequencePropagator};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the 4-channel segmentation model (ONNX file)
    #[arg(short, long)]
    model: String,

    /// Dataset root containing JPEGImages/ and Annotations/
    #[arg(short, long)]
    dataset: PathBuf,

    /// Resolution sub-directory of the dataset
    #[arg(long, default_value = "480p")]
    resolution: String,

    /// Text file listing the sequences to evaluate, one per line
    #[arg(long)]
    sequences: Option<PathBuf>,

    /// TOML file with evaluation settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to write the result record
    #[arg(long)]
    report: Option<PathBuf>,

    /// Directory for per-frame prediction PNGs
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    seeding: Option<SeedingPolicy>,

    #[arg(long, value_enum)]
    normalization: Option<Normalization>,

    #[arg(long, value_enum)]
    undefined_iou: Option<UndefinedIouPolicy>,

    /// Index of the model output holding the class scores
    #[arg(long)]
    model_output: Option<usize>,

    /// ONNX Runtime intra-op threads per model
    #[arg(long)]
    intra_threads: Option<usize>,

    /// Number of sequences evaluated concurrently
    #[arg(long)]
    workers: Option<usize>,

    /// Abort on the first unreadable frame
    #[arg(long)]
    strict: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<(EvalConfig, Self)> {
        let mut config = match &self.config {
            Some(path) => EvalConfig::load(path)?,
            None => EvalConfig::default(),
        };

        if let Some(seeding) = self.seeding {
            config.seeding = seeding;
        }
        if let Some(normalization) = self.normalization {
            config.normalization = normalization;
        }
        if let Some(policy) = self.undefined_iou {
            config.undefined_iou = policy;
        }
        if let Some(index) = self.model_output {
            config.model_output = index;
        }
        if let Some(threads) = self.intra_threads {
            config.intra_threads = threads;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(report) = &self.report {
            config.report_path = report.clone();
        }
        if let Some(dir) = &self.dump_dir {
            config.dump_dir = Some(dir.clone());
        }
        config.strict |= self.strict;

        config.validate()?;
        Ok((config, self))
    }
}

fn main() -> Result<()> {
    let (config, args) = Args::parse().into_config()?;

    // Initialize logging
    let log_level = if args.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    tracing::info!("masktrack-eval starting");
    tracing::info!("Network input: {}x{}", config.input_width, config.input_height);
    tracing::info!(
        "Seeding: {:?}, normalization: {:?}, guidance magnitude: {}",
        config.seeding,
        config.normalization,
        config.guidance_magnitude()
    );
    tracing::info!("Undefined IoU: {:?}", config.undefined_iou);
    tracing::info!(
        "Model output {}, {} intra-op threads",
        config.model_output,
        config.intra_threads
    );

    let mut source = DavisSource::new(&args.dataset, &args.resolution);
    if let Some(list) = &args.sequences {
        source = source.with_sequence_list(list);
    }
    let sequence_ids = source
        .sequence_ids()
        .context("Failed to enumerate sequences")?;

    let dump = config.dump_dir.as_ref().map(PngFrameDump::new);
    let mut propagator = SequencePropagator::from_config(&config);
    if let Some(dump) = &dump {
        propagator = propagator.with_sink(dump as &dyn PredictionSink);
    }
    let aggregator = EvaluationAggregator::new(propagator)
        .strict(config.strict)
        .with_report_path(&config.report_path);

    let load_model = || {
        segmentation::create_default_model(
            &args.model,
            config.network_size(),
            config.model_output,
            config.intra_threads,
        )
    };
    let report = if config.workers > 1 {
        aggregator.run_parallel(&source, &sequence_ids, config.workers, || {
            load_model().map_err(ModelError::Backend)
        })?
    } else {
        let mut model = load_model().context("Failed to load segmentation model")?;
        aggregator.run(&source, &sequence_ids, &mut model)?
    };

    match report.mean_iou {
        Some(mean) => println!("{mean}"),
        None => println!("null"),
    }
    Ok(())
}

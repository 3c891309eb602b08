use anyhow::{Context, Result};
use clap::Parser;
use evncf::{init_tracing, predict_topk, Config, Dataset, ExperimentRunner, TopKOptions};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    /// JSON dataset with `num_users`, `num_items`, `keyphrase_names`, `train` and `test`.
    #[arg(short, long)]
    dataset: PathBuf,

    /// Train one model on the first grid row and write its explained top-K
    /// recommendations here instead of running the experiment.
    #[arg(short, long)]
    recommendations: Option<PathBuf>,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    std::env::set_var("RUST_LOG", &args.log_level);
    init_tracing();

    info!("Starting E-VNCF trainer");

    let config = if Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    info!("Training configuration loaded: {:?}", config.training);

    let dataset = Dataset::from_json_file(&args.dataset)
        .with_context(|| format!("failed to read dataset {}", args.dataset.display()))?;
    info!(
        "Dataset: {} users, {} items, {} keyphrases, {} train / {} test interactions",
        dataset.num_users,
        dataset.num_items,
        dataset.text_dim(),
        dataset.train.len(),
        dataset.test.len()
    );

    let keyphrase_names = dataset.keyphrase_names.clone();
    let runner = ExperimentRunner::new(config, dataset)?;

    match args.recommendations {
        Some(path) => {
            let model = runner.train_final_model()?;
            let prediction_config = &runner.config().prediction;
            let options = TopKOptions::from_config(prediction_config)
                .with_explanations(prediction_config.topk_keyphrases);
            let observed = runner.train_interactions();
            let prediction = predict_topk(&model, observed, &options, &keyphrase_names)?;

            let file = fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &prediction)?;
            info!("Wrote recommendations for {} users to {}", prediction.items.len(), path.display());
            model.close();
        }
        None => {
            let results = runner.run()?;
            info!(
                "Experiment finished with {} result rows in {}",
                results.len(),
                runner.table_file().display()
            );
        }
    }

    Ok(())
}

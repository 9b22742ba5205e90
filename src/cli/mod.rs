//! Thin CLI over the library. Exit code 0 on success, nonzero on any
//! error (via anyhow in `main`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_stream::StreamExt;

use crate::concepts::{ConceptEdit, ConceptType, ExampleIn};
use crate::dataset::LabelSelection;
use crate::error::SiftError;
use crate::init::AppContext;
use crate::pipeline::MapOptions;
use crate::query::options::{Column, SelectRowsOptions};
use crate::schema::Path;
use crate::signals::SignalDescriptor;

#[derive(Parser)]
#[command(name = "sift", about = "Dataset curation engine", version)]
pub struct Cli {
    /// Project directory (defaults to SIFT_PROJECT_DIR or the platform
    /// data dir).
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit raw JSON instead of tables.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Dataset operations.
    #[command(subcommand)]
    Dataset(DatasetCommands),
    /// Run a signal over a dataset column.
    Signal {
        namespace: String,
        name: String,
        /// Signal name, e.g. pii, lang_detection, text_statistics.
        signal: String,
        /// Source path, e.g. "text".
        path: String,
        /// Signal parameters as JSON.
        #[arg(long)]
        params: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },
    /// Compute an embedding column.
    Embed {
        namespace: String,
        name: String,
        embedding: String,
        path: String,
    },
    /// Concept operations.
    #[command(subcommand)]
    Concept(ConceptCommands),
    /// Label operations.
    #[command(subcommand)]
    Label(LabelCommands),
}

#[derive(Subcommand)]
pub enum DatasetCommands {
    /// Create a dataset from a JSON file holding an array of objects.
    Create {
        namespace: String,
        name: String,
        input: PathBuf,
    },
    /// Show schema and enrichments.
    Info { namespace: String, name: String },
    /// Select rows.
    Select {
        namespace: String,
        name: String,
        /// Projected paths; defaults to all columns.
        #[arg(long)]
        columns: Vec<String>,
        /// Filters as JSON (tagged form), e.g.
        /// '[{"type":"binary","path":"source","op":"equals","value":"web"}]'.
        #[arg(long)]
        filters: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// List datasets in the project.
    List,
}

#[derive(Subcommand)]
pub enum ConceptCommands {
    Create { namespace: String, name: String },
    /// Add a labeled example.
    AddExample {
        namespace: String,
        name: String,
        text: String,
        /// Negative example (default is positive).
        #[arg(long)]
        negative: bool,
    },
    /// Train against an embedding and report metrics.
    Train {
        namespace: String,
        name: String,
        embedding: String,
    },
    /// Score a text with a trained concept.
    Score {
        namespace: String,
        name: String,
        embedding: String,
        text: String,
    },
    Remove { namespace: String, name: String },
}

#[derive(Subcommand)]
pub enum LabelCommands {
    Add {
        namespace: String,
        name: String,
        label: String,
        /// Row ids to label.
        #[arg(long = "row-id")]
        row_ids: Vec<String>,
    },
    Remove {
        namespace: String,
        name: String,
        label: String,
        #[arg(long = "row-id")]
        row_ids: Vec<String>,
    },
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template is valid"),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

pub async fn execute(cli: Cli) -> Result<(), SiftError> {
    let ctx = AppContext::new(cli.project_dir.clone())?;
    match cli.command {
        Commands::Dataset(cmd) => dataset_command(&ctx, cmd, cli.json).await,
        Commands::Signal {
            namespace,
            name,
            signal,
            path,
            params,
            overwrite,
        } => {
            let dataset = ctx.open_dataset(&namespace, &name)?;
            let params = match params {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::Value::Null,
            };
            let descriptor = SignalDescriptor::new(signal.clone(), params);
            let source_path: Path = path.as_str().into();
            let bar = spinner(&format!("Computing {signal} over {path}"));
            let result = dataset
                .compute_signal(
                    &descriptor,
                    &source_path,
                    MapOptions {
                        overwrite,
                        batch_size: 64,
                        ..Default::default()
                    },
                )
                .await?;
            bar.finish_and_clear();
            println!(
                "{} {} rows written to {} ({} errors)",
                "done:".green().bold(),
                result.num_processed,
                result.output_path,
                result.num_errors
            );
            Ok(())
        }
        Commands::Embed {
            namespace,
            name,
            embedding,
            path,
        } => {
            let dataset = ctx.open_dataset(&namespace, &name)?;
            let source_path: Path = path.as_str().into();
            let bar = spinner(&format!("Embedding {path} with {embedding}"));
            let result = dataset.compute_embedding(&embedding, &source_path).await?;
            bar.finish_and_clear();
            println!(
                "{} {} rows embedded into {}",
                "done:".green().bold(),
                result.num_processed,
                result.output_path
            );
            Ok(())
        }
        Commands::Concept(cmd) => concept_command(&ctx, cmd, cli.json).await,
        Commands::Label(cmd) => label_command(&ctx, cmd).await,
    }
}

async fn dataset_command(
    ctx: &AppContext,
    cmd: DatasetCommands,
    json: bool,
) -> Result<(), SiftError> {
    match cmd {
        DatasetCommands::Create {
            namespace,
            name,
            input,
        } => {
            let raw = std::fs::read_to_string(&input)?;
            let items: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
            let dataset = ctx.create_dataset(&namespace, &name, &items, None).await?;
            println!(
                "{} dataset {}/{} with {} rows",
                "created:".green().bold(),
                dataset.namespace(),
                dataset.name(),
                dataset.num_rows()
            );
            Ok(())
        }
        DatasetCommands::Info { namespace, name } => {
            let dataset = ctx.open_dataset(&namespace, &name)?;
            let manifest = dataset.manifest();
            if json {
                println!("{}", serde_json::to_string_pretty(manifest.as_ref())?);
                return Ok(());
            }
            println!(
                "{} {}/{} — {} rows",
                "dataset:".bold(),
                namespace,
                name,
                manifest.num_rows
            );
            let mut table = Table::new();
            table.set_header(["output path", "signal", "rows", "source path"]);
            for entry in &manifest.enrichments {
                table.add_row([
                    entry.output_path.to_string(),
                    entry.signal.name.clone(),
                    entry.num_items.to_string(),
                    entry.source_path.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        DatasetCommands::Select {
            namespace,
            name,
            columns,
            filters,
            limit,
            offset,
        } => {
            let dataset = ctx.open_dataset(&namespace, &name)?;
            let options = SelectRowsOptions {
                columns: if columns.is_empty() {
                    None
                } else {
                    Some(columns.iter().map(|c| Column::Path(c.as_str().into())).collect())
                },
                filters: match filters {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => Vec::new(),
                },
                limit,
                offset,
                ..Default::default()
            };
            let mut stream = dataset.select_rows(&options).await?;
            while let Some(row) = stream.next().await {
                println!("{}", serde_json::to_string(&row?.value)?);
            }
            Ok(())
        }
        DatasetCommands::List => {
            for (namespace, name) in ctx.list_datasets()? {
                println!("{namespace}/{name}");
            }
            Ok(())
        }
    }
}

async fn concept_command(
    ctx: &AppContext,
    cmd: ConceptCommands,
    json: bool,
) -> Result<(), SiftError> {
    match cmd {
        ConceptCommands::Create { namespace, name } => {
            ctx.concepts.create(&namespace, &name, ConceptType::Text)?;
            println!("{} concept {namespace}/{name}", "created:".green().bold());
            Ok(())
        }
        ConceptCommands::AddExample {
            namespace,
            name,
            text,
            negative,
        } => {
            let concept = ctx.concepts.edit(
                &namespace,
                &name,
                ConceptEdit {
                    insert: vec![ExampleIn {
                        label: !negative,
                        text,
                        origin: None,
                    }],
                    ..Default::default()
                },
            )?;
            println!(
                "{} v{} ({} pos / {} neg)",
                "updated:".green().bold(),
                concept.version,
                concept.num_positives(),
                concept.num_negatives()
            );
            Ok(())
        }
        ConceptCommands::Train {
            namespace,
            name,
            embedding,
        } => {
            let bar = spinner(&format!("Training {namespace}/{name} on {embedding}"));
            let model = ctx.scorer.get_or_train(&namespace, &name, &embedding).await?;
            bar.finish_and_clear();
            if json {
                println!("{}", serde_json::to_string_pretty(&model.metrics)?);
                return Ok(());
            }
            println!(
                "{} auc={:.3} f1={:.3} precision={:.3} recall={:.3} ({} pos / {} neg)",
                "trained:".green().bold(),
                model.metrics.roc_auc,
                model.metrics.f1,
                model.metrics.precision,
                model.metrics.recall,
                model.metrics.num_positives,
                model.metrics.num_negatives
            );
            Ok(())
        }
        ConceptCommands::Score {
            namespace,
            name,
            embedding,
            text,
        } => {
            let model = ctx.scorer.get_or_train(&namespace, &name, &embedding).await?;
            let embedder = ctx.embeddings.get(&embedding)?;
            let vectors = embedder.embed_batch(&[text]).await?;
            let scores = model.score(&vectors)?;
            println!("{:.4}", scores[0]);
            Ok(())
        }
        ConceptCommands::Remove { namespace, name } => {
            ctx.concepts.remove(&namespace, &name)?;
            println!("{} concept {namespace}/{name}", "removed:".green().bold());
            Ok(())
        }
    }
}

async fn label_command(ctx: &AppContext, cmd: LabelCommands) -> Result<(), SiftError> {
    match cmd {
        LabelCommands::Add {
            namespace,
            name,
            label,
            row_ids,
        } => {
            let dataset = ctx.open_dataset(&namespace, &name)?;
            let changed = dataset
                .add_labels(&label, LabelSelection::RowIds(row_ids))
                .await?;
            println!("{} {changed} rows labeled '{label}'", "done:".green().bold());
            Ok(())
        }
        LabelCommands::Remove {
            namespace,
            name,
            label,
            row_ids,
        } => {
            let dataset = ctx.open_dataset(&namespace, &name)?;
            let changed = dataset
                .remove_labels(&label, LabelSelection::RowIds(row_ids))
                .await?;
            println!("{} '{label}' removed from {changed} rows", "done:".green().bold());
            Ok(())
        }
    }
}

//! Caption Attention CLI - beam attention inspection for image captioners
//!
//! Command-line interface for tracing, merging and rendering per-step
//! attention of a beam-search captioner.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::merge::MergeCommand;
use commands::render::RenderCommand;
use commands::trace::TraceCommand;

#[derive(Parser)]
#[command(
    name = "caption-attention",
    version,
    about = "Inspect where a beam-search captioner looks while it writes",
    long_about = "Reconstruct, for every generated caption, which beam hypothesis carried it at each\n\
                  decoding step and the attention it paid to the detected image regions.\n\n\
                  Three stages:\n  \
                  - trace: sweep the inference batches once and write one record per image\n  \
                  - merge: combine per-image records into a single index\n  \
                  - render: draw the top attended regions of every step over the source image",
    after_help = "EXAMPLES:\n  \
                  caption-attention trace --config trace.yaml\n  \
                  caption-attention trace --config trace.yaml --beam-size 3 --output-dir debug_att_dir\n  \
                  caption-attention merge --input-dir debug_att_dir --output merged_att_result.json\n  \
                  caption-attention render --id2info merged_att_result.json --image-dir coco --result-dir attention_images\n\n\
                  For more details on a specific command:\n  \
                  caption-attention <COMMAND> --help"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep inference batches and record each image's caption trace
    Trace(TraceCommand),

    /// Merge per-image records into one index file
    Merge(MergeCommand),

    /// Render annotated attention figures from a merged index
    Render(RenderCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Trace(cmd) => cmd.execute(),
        Commands::Merge(cmd) => cmd.execute(),
        Commands::Render(cmd) => cmd.execute(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_render_requires_result_dir() {
        assert!(Cli::try_parse_from(["caption-attention", "render"]).is_err());
        assert!(Cli::try_parse_from(["caption-attention", "render", "--result-dir", "out"]).is_ok());
    }

    #[test]
    fn test_merge_defaults() {
        assert!(Cli::try_parse_from(["caption-attention", "-v", "merge"]).is_ok());
    }
}

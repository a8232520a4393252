use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use localrag::{
    chat::DEFAULT_TOP_K,
    chunking::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE},
    embedding::DEFAULT_BATCH_SIZE,
    generation,
    model_manager,
    text_util::DEFAULT_MAX_WORDS,
};

#[derive(Debug, Parser)]
#[command(
    name = "localrag",
    about = "Index local documents and chat with them through a local language model"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the index from a directory of .txt and .pdf files
    Ingest(IngestArgs),
    /// Ask questions about the indexed documents
    Chat(ChatArgs),
    /// Show what the current index contains
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Directory containing the documents
    #[arg(default_value = "data")]
    pub input: PathBuf,

    /// Where to write the index (defaults to <data-dir>/index)
    #[arg(long)]
    pub index_dir: Option<PathBuf>,

    /// Maximum chunk size in characters
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Characters shared by adjacent chunks
    #[arg(long, default_value_t = DEFAULT_CHUNK_OVERLAP)]
    pub chunk_overlap: usize,

    /// Embedding model ID (HuggingFace) or local model directory
    #[arg(
        long,
        env = model_manager::MODEL_ENV_VAR,
        default_value = model_manager::DEFAULT_MODEL_ID
    )]
    pub embed_model: String,

    /// Chunks embedded per batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,
}

// -- Chat --

#[derive(Debug, Parser)]
pub struct ChatArgs {
    /// Directory holding the index (defaults to <data-dir>/index)
    #[arg(long)]
    pub index_dir: Option<PathBuf>,

    /// Path to a GGUF language model (defaults to <data-dir>/models/orca-mini-3b-gguf2-q4_0.gguf)
    #[arg(short, long, env = generation::MODEL_ENV_VAR)]
    pub model: Option<PathBuf>,

    /// Embedding model ID; must match the one used for ingestion
    #[arg(
        long,
        env = model_manager::MODEL_ENV_VAR,
        default_value = model_manager::DEFAULT_MODEL_ID
    )]
    pub embed_model: String,

    /// Number of chunks retrieved per question
    #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Keep only this many trailing words of each question
    #[arg(long, default_value_t = DEFAULT_MAX_WORDS)]
    pub max_words: usize,

    /// Context window of the language model in tokens
    #[arg(long, default_value = "2048")]
    pub context_size: u32,

    /// Maximum tokens generated per answer
    #[arg(long, default_value = "200")]
    pub max_tokens: usize,

    /// Sampling temperature (0 for greedy decoding)
    #[arg(long, default_value = "0.7")]
    pub temperature: f32,

    /// Sampling seed
    #[arg(long, default_value = "42")]
    pub seed: u32,

    /// Rewrite follow-up questions into standalone ones before retrieval
    #[arg(long)]
    pub condense: bool,

    /// Print the source of each retrieved chunk after the answer
    #[arg(long)]
    pub show_sources: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Directory holding the index (defaults to <data-dir>/index)
    #[arg(long)]
    pub index_dir: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "localrag",
            &mut std::io::stdout(),
        );
    }
}

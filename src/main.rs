use std::path::PathBuf;

use clap::Parser;
use localrag::{
    DataDir,
    VectorIndex,
    chat::{self, ChatConfig, ChatSession},
    chunking::ChunkingConfig,
    embedding::embedder_for,
    error::{self, Error},
    generation::{
        DEFAULT_MODEL_FILE,
        GenerationConfig,
        LlamaGenerator,
    },
    ingest::{IngestOptions, ingest_directory},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{ChatArgs, Cli, Command, IngestArgs, StatusArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("LOCALRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Ingest(args) => cmd_ingest(&data_dir, &args, cli.quiet)?,
        Command::Chat(args) => cmd_chat(&data_dir, &args)?,
        Command::Status(args) => cmd_status(&data_dir, &args)?,
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cmd_ingest(
    data_dir: &DataDir,
    args: &IngestArgs,
    quiet: bool,
) -> error::Result<()> {
    let chunking = ChunkingConfig::new(args.chunk_size, args.chunk_overlap)?;
    if args.batch_size == 0 {
        return Err(Error::Config("batch size must be at least 1".into()));
    }
    let index_dir = resolve_index_dir(data_dir, args.index_dir.as_ref());

    let options = IngestOptions {
        chunking,
        batch_size: args.batch_size,
        progress: !args.no_progress && !quiet,
    };
    let mut embedder = embedder_for(&args.embed_model);

    eprintln!("Indexing {}...", args.input.display());
    let report = ingest_directory(
        &args.input,
        &index_dir,
        embedder.as_mut(),
        &options,
    )?;

    println!(
        "Indexed {} documents into {} chunks ({} dimensions)",
        report.documents, report.chunks, report.dimension
    );
    println!("Index written to {}", report.index_path.display());
    Ok(())
}

fn cmd_chat(data_dir: &DataDir, args: &ChatArgs) -> error::Result<()> {
    let config = ChatConfig {
        top_k: args.top_k,
        max_words: args.max_words,
        condense: args.condense,
        show_sources: args.show_sources,
        ..ChatConfig::default()
    };
    config.validate()?;
    let generation = GenerationConfig {
        context_size: args.context_size,
        max_tokens: args.max_tokens,
        temperature: args.temperature,
        seed: args.seed,
        ..GenerationConfig::default()
    };
    generation.validate()?;

    // The index is checked before any model is loaded.
    let index_dir = resolve_index_dir(data_dir, args.index_dir.as_ref());
    let index = VectorIndex::open(&index_dir)?;

    let embedder = embedder_for(&args.embed_model);
    chat::check_embedder(&index, embedder.as_ref())?;

    let model_path = args
        .model
        .clone()
        .unwrap_or_else(|| data_dir.models_dir().join(DEFAULT_MODEL_FILE));
    let generator = LlamaGenerator::load(&model_path, generation)?;

    let mut session =
        ChatSession::new(index, embedder, Box::new(generator), config)?;

    let stdin = std::io::stdin();
    chat::run_loop(&mut session, stdin.lock(), std::io::stdout())
}

fn cmd_status(data_dir: &DataDir, args: &StatusArgs) -> error::Result<()> {
    let index_dir = resolve_index_dir(data_dir, args.index_dir.as_ref());
    let index = VectorIndex::open(&index_dir)?;
    let manifest = index.manifest();
    let sources = index.sources();

    if args.json {
        let value = serde_json::json!({
            "data_dir": data_dir.root(),
            "index": index.path(),
            "manifest": manifest,
            "sources": sources
                .iter()
                .map(|(source, chunks)| {
                    serde_json::json!({ "source": source, "chunks": chunks })
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Index: {}", index.path().display());
        println!("Embedding model: {}", manifest.model_id);
        println!("Dimension: {}", manifest.dimension);
        println!(
            "Chunking: {} chars, {} overlap",
            manifest.chunking.chunk_size, manifest.chunking.overlap
        );
        println!("Built at: {} (unix seconds)", manifest.built_at);
        println!("Documents: {}", sources.len());
        for (source, chunks) in &sources {
            println!("  {source}: {chunks} chunks");
        }
        println!("Chunks: {}", index.len());
    }
    Ok(())
}

fn resolve_index_dir(
    data_dir: &DataDir,
    explicit: Option<&PathBuf>,
) -> PathBuf {
    explicit.cloned().unwrap_or_else(|| data_dir.index_dir())
}

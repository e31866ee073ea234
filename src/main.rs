//! readalong CLI: run the HTTP server, or ingest/export books one-shot.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use readalong::config::Config;
use readalong::error::Result;
use readalong::export::export_book;
use readalong::ingest::ingest_book;
use readalong::store::FsBlobStore;

#[derive(Parser)]
#[command(name = "readalong", version, about = "Synchronized read-along book pipeline")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Ingest an EPUB file into the store and print the book id.
    Ingest { file: PathBuf },
    /// Export a book as EPUB 3 with media overlays.
    Export {
        book_id: String,
        /// Output path; defaults to the book title in the current directory.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            readalong::server::serve(config).await
        }
        Command::Ingest { file } => {
            let store = FsBlobStore::new(&config.storage_root)?;
            let bytes = std::fs::read(&file)?;
            let book = ingest_book(&store, &config.asset_url_prefix, Uuid::new_v4(), &bytes)?;
            println!("{}", book.id);
            println!("  title:    {}", book.metadata.title);
            println!("  chapters: {}", book.chapters.len());
            println!(
                "  words:    {}",
                book.chapters.iter().map(|c| c.word_count).sum::<usize>()
            );
            Ok(())
        }
        Command::Export { book_id, output } => {
            let store = FsBlobStore::new(&config.storage_root)?;
            let exported = export_book(&store, &book_id, &config.asset_url_prefix)?;
            let path = output.unwrap_or_else(|| PathBuf::from(&exported.filename));
            std::fs::write(&path, &exported.bytes)?;
            println!("wrote {} ({} bytes)", path.display(), exported.bytes.len());
            Ok(())
        }
    }
}

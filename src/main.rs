//! # Zimi CLI (`zimi`)
//!
//! ```bash
//! zimi serve --port 8899          # start the HTTP server
//! zimi search "water treatment"   # cross-archive search
//! zimi suggest "pytho"            # title autocomplete
//! zimi read wikipedia A/Water     # article as plain text
//! zimi list                       # installed archives
//! ```
//!
//! The archive directory and all other settings come from the environment
//! (see `config`); `--port` overrides `ZIMI_PORT` for `serve`.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;

use zimi::app::App;
use zimi::config::Config;
use zimi::search::SearchOptions;

#[derive(Parser)]
#[command(
    name = "zimi",
    about = "Offline knowledge server for Kiwix ZIM archives",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve {
        /// Listen port (overrides ZIMI_PORT).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Search across all archives.
    Search {
        /// The query string.
        query: String,

        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Restrict to one archive id.
        #[arg(long)]
        zim: Option<String>,

        /// Title-only search (skips the deep phase).
        #[arg(long)]
        fast: bool,
    },

    /// Title autocomplete.
    Suggest {
        /// The title prefix.
        query: String,

        /// Maximum number of suggestions.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Restrict to one archive id.
        #[arg(long)]
        zim: Option<String>,
    },

    /// Read an article as plain text.
    Read {
        /// Archive id (see `zimi list`).
        zim: String,
        /// Entry path, e.g. `A/Water`.
        path: String,
        /// Maximum characters to print.
        #[arg(long)]
        max_length: Option<usize>,
    },

    /// List installed archives.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::from_env()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
            let app = App::new(config);
            app.startup().await?;
            zimi::server::serve(app, addr).await?;
        }
        Commands::Search {
            query,
            limit,
            zim,
            fast,
        } => {
            let app = startup_for_cli(config).await?;
            let outcome = app
                .engine
                .search(
                    &query,
                    SearchOptions {
                        limit,
                        scope: zim.map(|z| vec![z]),
                        fast,
                        include_snippets: false,
                        ..Default::default()
                    },
                )
                .await?;
            for hit in &outcome.results {
                println!("{:>6.1}  {:<16} {}  ({})", hit.score, hit.archive, hit.title, hit.path);
            }
            if outcome.partial {
                println!("(partial)");
            }
        }
        Commands::Suggest { query, limit, zim } => {
            let app = startup_for_cli(config).await?;
            let suggestions = app
                .engine
                .suggest(&query, zim.map(|z| vec![z]), limit)
                .await?;
            for s in suggestions {
                println!("{:<16} {}  ({})", s.archive, s.title, s.path);
            }
        }
        Commands::Read {
            zim,
            path,
            max_length,
        } => {
            let app = startup_for_cli(config).await?;
            let article = app.read_article(&zim, &path, max_length).await?;
            println!("# {}\n", article.title);
            println!("{}", article.text);
            if article.truncated {
                println!("\n[truncated at {} of {} chars]", article.text.chars().count(), article.full_length);
            }
        }
        Commands::List => {
            let app = startup_for_cli(config).await?;
            for entry in app.registry.entries() {
                let meta = entry.meta();
                println!(
                    "{:<24} {:>8.2} GB  {:>9} entries  {}",
                    meta.id,
                    meta.size as f64 / (1024.0 * 1024.0 * 1024.0),
                    meta.entries,
                    meta.title
                );
            }
        }
    }
    Ok(())
}

/// Scan the library without spawning the server's background workers.
async fn startup_for_cli(config: Config) -> anyhow::Result<Arc<App>> {
    let app = App::new(config);
    app.refresh_library()
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    app.ensure_indexes().await;
    Ok(app)
}

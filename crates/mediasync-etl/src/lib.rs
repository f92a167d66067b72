//! MediaSync ETL Library
//!
//! Keeps a full-text search index in step with a relational content catalog
//! and prepares uploaded media for adaptive streaming.
//!
//! # Overview
//!
//! - **Extract**: page through videos whose record or tracks changed after
//!   the stored watermark ([`extract`])
//! - **Transform**: build search documents and schedule media packaging for
//!   changed tracks ([`transform`], [`packager`])
//! - **Load**: bulk-write documents into Elasticsearch ([`load`])
//! - **Checkpoint**: persist the watermark once a full pass completes
//!   ([`state`], [`orchestrator`])
//!
//! Connectivity failures are retried with bounded exponential backoff
//! ([`retry`]). Data errors are logged and the offending row or job is
//! dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use mediasync_etl::{EtlConfig, EtlProcess, State, JsonFileStorage};
//!
//! let config = EtlConfig::load()?;
//! let state = State::new(JsonFileStorage::new(&config.state.file));
//! let mut process = EtlProcess::new(extractor, transformer, loader, state, config.sync, cancel);
//! process.run().await?;
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod models;
pub mod orchestrator;
pub mod packager;
pub mod retry;
pub mod state;
pub mod transform;

// Re-export commonly used types
pub use config::EtlConfig;
pub use error::{EtlError, EtlResult};
pub use extract::{Extractor, Page, PostgresExtractor};
pub use load::{ElasticsearchLoader, LoadReport, Loader};
pub use models::{ContentRow, PackagingJob, SearchDocument, Watermark};
pub use orchestrator::{EtlProcess, Step};
pub use packager::{MediaConverter, MediaLayout, MediaPackager, PackagingOutcome, PackagingScheduler};
pub use retry::RetryPolicy;
pub use state::{JsonFileStorage, PostgresStorage, State, StateStorage};
pub use transform::{TransformOutput, Transformer};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// MediaSync ETL - content catalog to search index synchronization
#[derive(Parser, Debug)]
#[command(name = "mediasync-etl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Dotenv file to load instead of `.env_etl` / `.env`
    #[arg(long, env = "ETL_ENV_FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Override the page size
    #[arg(long, global = true)]
    pub pack_size: Option<i64>,

    /// Override the search index name
    #[arg(long, global = true)]
    pub index: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync loop until interrupted
    Run,

    /// Inspect the checkpoint store
    State {
        #[command(subcommand)]
        command: StateCommand,
    },

    /// Package one audio/video pair and wait for it to finish
    Package {
        /// Video track, relative to MEDIA_ROOT
        #[arg(long)]
        video: String,

        /// Audio track, relative to MEDIA_ROOT
        #[arg(long)]
        audio: String,

        /// Content id used to name the outputs (random if omitted)
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Create the search index if it does not exist
    EnsureIndex,
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum StateCommand {
    /// Print the whole checkpoint
    Show,

    /// Print one key
    Get {
        /// Checkpoint key
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["mediasync-etl"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_package_args() {
        let id = Uuid::from_u128(5);
        let cli = Cli::try_parse_from([
            "mediasync-etl",
            "package",
            "--video",
            "video/5.mp4",
            "--audio",
            "audio/5.aac",
            "--id",
            &id.to_string(),
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Package { video, audio, id: Some(parsed) }) => {
                assert_eq!(video, "video/5.mp4");
                assert_eq!(audio, "audio/5.aac");
                assert_eq!(parsed, id);
            },
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_state_get_with_overrides() {
        let cli = Cli::try_parse_from(["mediasync-etl", "--pack-size", "50", "state", "get", "time"]).unwrap();

        assert_eq!(cli.pack_size, Some(50));
        assert!(matches!(
            cli.command,
            Some(Commands::State { command: StateCommand::Get { ref key } }) if key == "time"
        ));
    }
}

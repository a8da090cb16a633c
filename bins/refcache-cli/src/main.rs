// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! refcache CLI
//!
//! Applies JSON write fixtures to a fresh normalized store and prints the
//! result. Logs go to stderr so stdout stays machine-readable.

mod apply;

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use refcache_config_fs::FsConfigStore;
use refcache_core::{CacheConfig, ConfigService, PolicyConfig, Variables};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use crate::apply::{apply, WriteInputs};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Command to execute
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Write a result into an empty store and print the normalized records
    Write {
        /// Query document (JSON)
        #[clap(short, long)]
        query: PathBuf,
        /// Operation result (JSON)
        #[clap(short, long)]
        result: PathBuf,
        /// Variable bindings (JSON object)
        #[clap(long)]
        variables: Option<PathBuf>,
        /// Declarative type policies (JSON)
        #[clap(short, long)]
        policies: Option<PathBuf>,
        /// Cache configuration (JSON); defaults to the saved user config
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Store the result under this id instead of the operation root
        #[clap(long)]
        data_id: Option<String>,
        /// Advance the eviction clock by this many milliseconds and run due jobs
        #[clap(long)]
        advance_ms: Option<u64>,
    },
    /// Print the effective cache configuration
    Config {
        /// Save the defaults first, unless a configuration is already saved
        #[clap(long)]
        init: bool,
        /// Config directory; defaults to the platform config directory
        #[clap(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    match args.cmd {
        Command::Write {
            query,
            result,
            variables,
            policies,
            config,
            data_id,
            advance_ms,
        } => {
            let config = match config {
                Some(path) => read_json(&path)?,
                None => user_config()?,
            };
            let inputs = WriteInputs {
                query: read_json(&query)?,
                result: read_json(&result)?,
                variables: variables.as_deref().map(read_json::<Variables>).transpose()?,
                policies: policies
                    .as_deref()
                    .map(read_json::<PolicyConfig>)
                    .transpose()?
                    .unwrap_or_default(),
                config,
                data_id,
                advance_ms,
            };
            let report = apply(inputs).await?;
            emit(&report)?;
        }
        Command::Config { init, dir } => {
            let store = match dir {
                Some(dir) => FsConfigStore::with_base(dir)?,
                None => FsConfigStore::new()?,
            };
            emit(&effective_config(store, init)?)?;
        }
    }

    Ok(())
}

fn user_config() -> Result<CacheConfig> {
    Ok(ConfigService::new(FsConfigStore::new()?).load()?)
}

fn effective_config(store: FsConfigStore, init: bool) -> Result<CacheConfig> {
    let dir = store.base().to_path_buf();
    let service = ConfigService::new(store);
    let config = if init { service.init()? } else { service.load()? };
    debug!(dir = %dir.display(), init, "configuration resolved");
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use refcache_core::{BuildMode, CONFIG_KEY};

    #[test]
    fn config_command_reads_defaults_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::with_base(dir.path()).unwrap();
        let file = store.file_for(CONFIG_KEY);
        assert_eq!(effective_config(store, false).unwrap(), CacheConfig::default());
        assert!(!file.exists());
    }

    #[test]
    fn init_saves_defaults_then_leaves_edits_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::with_base(dir.path()).unwrap();
        let file = store.file_for(CONFIG_KEY);
        effective_config(store.clone(), true).unwrap();
        let saved: CacheConfig = read_json(&file).unwrap();
        assert_eq!(saved, CacheConfig::default());

        ConfigService::new(store.clone())
            .save(&CacheConfig::production())
            .unwrap();
        let config = effective_config(store, true).unwrap();
        assert_eq!(config.mode, BuildMode::Production);
    }

    #[test]
    fn args_accept_a_config_directory() {
        let args = Args::try_parse_from(["refcache", "config", "--init", "--dir", "/tmp/rc"]).unwrap();
        let Command::Config { init, dir } = args.cmd else {
            unreachable!("parsed the config subcommand");
        };
        assert!(init);
        assert_eq!(dir, Some(PathBuf::from("/tmp/rc")));
    }
}

//! tarsync CLI - keep package repositories in sync from tarball snapshots

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::warn;

use tarsync::{
    CleanupRegistry, Config, Error, ExtractorKind, RepoConfig, Sha256Digest, SourceUri,
    SyncReport, SwapOutcome, GLOBAL_CONFIG_PATH, INTERRUPTED_EXIT_CODE,
};

#[derive(Parser)]
#[command(name = "tarsync")]
#[command(about = "sync package repositories from tarball snapshots")]
#[command(version)]
struct Cli {
    /// global config file
    #[arg(short, long, env = "TARSYNC_CONFIG", default_value = GLOBAL_CONFIG_PATH)]
    config: PathBuf,

    /// local config file overriding the global one
    #[arg(short, long, env = "TARSYNC_LOCAL_CONFIG")]
    local: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// sync a directory from a tarball uri
    Sync {
        /// source uri, e.g. tar+https://host/repo.tar.xz
        uri: String,

        /// repository directory to replace
        basedir: PathBuf,

        /// expected sha256 of the archive
        #[arg(long)]
        sha256: Option<String>,

        /// extractor to use: tar, native
        #[arg(long)]
        extractor: Option<ExtractorKind>,
    },

    /// sync configured repositories (all when none given)
    SyncRepo {
        names: Vec<String>,
    },

    /// validate a sync uri
    CheckUri {
        uri: String,
    },

    /// list configured repositories
    Repos,

    /// add a repository to the config file
    AddRepo {
        name: String,

        /// repository directory
        location: PathBuf,

        /// source uri
        uri: String,

        /// expected sha256 of the archive
        #[arg(long)]
        sha256: Option<String>,
    },

    /// remove a repository from the config file
    RemoveRepo {
        name: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cleanup = CleanupRegistry::new();
    if let Err(e) = cleanup.install_signal_handler() {
        warn!("could not install signal handler: {}", e);
    }

    // dropped before exit on success, error and interrupt alike
    let result = {
        let _guard = cleanup.guard();
        run(cli, &cleanup)
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Interrupted) => {
            eprintln!("interrupted");
            ExitCode::from(INTERRUPTED_EXIT_CODE)
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, cleanup: &CleanupRegistry) -> tarsync::Result<()> {
    // edits go to the local config when one is given
    let editable = cli.local.clone().unwrap_or_else(|| cli.config.clone());

    match cli.command {
        Commands::Sync {
            uri,
            basedir,
            sha256,
            extractor,
        } => {
            let mut config = Config::load_layered(&cli.config, cli.local.as_deref())?;
            if let Some(extractor) = extractor {
                config.sync.extractor = extractor;
            }
            let expected = sha256.as_deref().map(Sha256Digest::from_hex).transpose()?;

            let report = tarsync::sync(&uri, &basedir, &config.sync, expected.as_ref(), cleanup)?;
            print_report(&report);
        }

        Commands::SyncRepo { names } => {
            let config = Config::load_layered(&cli.config, cli.local.as_deref())?;

            let repos: Vec<&RepoConfig> = if names.is_empty() {
                config.repos.iter().collect()
            } else {
                names
                    .iter()
                    .map(|name| {
                        config
                            .get_repo(name)
                            .ok_or_else(|| Error::RepoNotFound(name.clone()))
                    })
                    .collect::<tarsync::Result<_>>()?
            };

            for repo in repos {
                println!("syncing {}", repo.name);
                let report = tarsync::sync(
                    &repo.sync_uri,
                    &repo.location,
                    &config.sync,
                    repo.sha256.as_ref(),
                    cleanup,
                )?;
                print_report(&report);
            }
        }

        Commands::CheckUri { uri } => {
            let source = SourceUri::parse(&uri)?;
            println!("{} ({})", source.url(), source.compression());
        }

        Commands::Repos => {
            let config = Config::load_layered(&cli.config, cli.local.as_deref())?;

            for repo in &config.repos {
                println!("{} {} {}", repo.name, repo.location.display(), repo.sync_uri);
            }
        }

        Commands::AddRepo {
            name,
            location,
            uri,
            sha256,
        } => {
            SourceUri::parse(&uri)?;
            let path = editable.as_path();
            let mut config = load_or_default(path)?;

            let mut repo = RepoConfig::new(&name, location, uri);
            repo.sha256 = sha256.as_deref().map(Sha256Digest::from_hex).transpose()?;
            config.add_repo(repo)?;
            config.save(path)?;
            println!("added repo {} to {}", name, path.display());
        }

        Commands::RemoveRepo { name } => {
            let path = editable.as_path();
            let mut config = Config::load(path)?;
            config.remove_repo(&name)?;
            config.save(path)?;
            println!("removed repo {} from {}", name, path.display());
        }
    }

    Ok(())
}

fn load_or_default(path: &Path) -> tarsync::Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

fn print_report(report: &SyncReport) {
    let action = match report.outcome {
        SwapOutcome::Replaced => "updated",
        SwapOutcome::Bootstrapped => "created",
    };
    println!(
        "{} {} from {} ({} bytes{})",
        action,
        report.basedir.display(),
        report.uri,
        report.bytes_fetched,
        if report.verified { ", sha256 verified" } else { "" }
    );
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// webtrawl cli
#[derive(Parser)]
#[command(name = "webtrawl")]
#[command(about = "Depth- and budget-bounded web crawler for allowlisted domains")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawl from a configuration file
    Crawl {
        /// Path to the TOML crawl configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Extra seed URLs appended to the configured list
        #[arg(short, long)]
        seed: Vec<String>,

        /// Override the worker count
        #[arg(short, long)]
        workers: Option<usize>,

        /// Override the maximum crawl depth
        #[arg(short = 'd', long)]
        max_depth: Option<u32>,

        /// Directory for log files (logs to stdout only when omitted)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Validate a configuration file without crawling
    CheckConfig {
        /// Path to the TOML crawl configuration
        #[arg(short, long)]
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crawl_command_parses() {
        let cli = Cli::try_parse_from([
            "webtrawl",
            "crawl",
            "--config",
            "crawl.toml",
            "--seed",
            "http://a.example/",
            "--workers",
            "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Crawl {
                config,
                seed,
                workers,
                max_depth,
                log_dir,
            } => {
                assert_eq!(config, PathBuf::from("crawl.toml"));
                assert_eq!(seed, vec!["http://a.example/"]);
                assert_eq!(workers, Some(4));
                assert_eq!(max_depth, None);
                assert!(log_dir.is_none());
            }
            _ => panic!("expected crawl command"),
        }
    }

    #[test]
    fn test_check_config_parses() {
        let cli =
            Cli::try_parse_from(["webtrawl", "check-config", "--config", "c.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::CheckConfig { .. }));
    }

    #[test]
    fn test_missing_config_is_an_error() {
        assert!(Cli::try_parse_from(["webtrawl", "crawl"]).is_err());
    }
}

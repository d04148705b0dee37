use std::process::ExitCode;

use webtrawl::cli::{Cli, Commands};
use webtrawl::coordinator::{CrawlCoordinator, EndReason};
use webtrawl::CrawlConfig;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_FAILURE: u8 = 3;
const EXIT_INTERRUPTED: u8 = 4;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::CheckConfig { config } => match CrawlConfig::load(&config) {
            Ok(_) => {
                println!("{} is valid", config.display());
                ExitCode::from(EXIT_OK)
            }
            Err(e) => {
                eprintln!("{e}");
                ExitCode::from(EXIT_CONFIG_ERROR)
            }
        },

        Commands::Crawl {
            config,
            seed,
            workers,
            max_depth,
            log_dir,
        } => {
            if let Err(e) = webtrawl::logging::init(log_dir) {
                eprintln!("failed to initialize logging: {e}");
                return ExitCode::from(EXIT_RUNTIME_FAILURE);
            }

            let mut config = match CrawlConfig::load(&config) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("{e}");
                    return ExitCode::from(EXIT_CONFIG_ERROR);
                }
            };
            config.seed_urls.extend(seed);
            if let Some(workers) = workers {
                config.threads_per_crawl = workers;
            }
            if let Some(depth) = max_depth {
                config.max_crawl_depth = depth;
            }

            let coordinator = match CrawlCoordinator::new(config) {
                Ok(coordinator) => coordinator,
                Err(e) => {
                    tracing::error!("failed to start crawl: {e}");
                    return ExitCode::from(EXIT_CONFIG_ERROR);
                }
            };

            {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received, draining crawl");
                        coordinator.stop();
                    }
                });
            }

            let summary = coordinator.run().await;
            tracing::info!(
                "crawl {} finished: {} ({})",
                summary.crawl_id,
                summary.stats,
                summary.reason.as_str()
            );

            match summary.reason {
                EndReason::Completed
                | EndReason::MaxDurationExceeded
                | EndReason::BudgetExhausted => ExitCode::from(EXIT_OK),
                EndReason::Stopped => ExitCode::from(EXIT_INTERRUPTED),
                EndReason::FatalError => ExitCode::from(EXIT_RUNTIME_FAILURE),
            }
        }
    }
}

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use sitewarden::config::Config;
use sitewarden::jobs::Scheduler;
use sitewarden::storage::Store;

/// Defacement-detection crawler. Mode and tunables come from the
/// environment; the flags below restrict which sites run.
#[derive(Debug, Parser)]
#[command(name = "sitewarden", version)]
struct Cli {
    /// Crawl only this site.
    #[arg(long = "siteid")]
    siteid: Option<i64>,
    /// Crawl only this customer's sites.
    #[arg(long = "custid")]
    custid: Option<i64>,
    /// Crawl multiple sites concurrently.
    #[arg(long)]
    parallel: bool,
    /// Cap on concurrently crawled sites (implies --parallel).
    #[arg(long = "max_parallel_sites")]
    max_parallel_sites: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(n) = cli.max_parallel_sites {
        if n == 0 {
            eprintln!("configuration error: --max_parallel_sites must be > 0");
            return ExitCode::from(2);
        }
        config.max_parallel_sites = n;
    } else if !cli.parallel {
        config.max_parallel_sites = 1;
    }
    let config = Arc::new(config);

    let store = match Store::connect(
        &config.database_url,
        config.db_pool_size,
        config.db_acquire_timeout,
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open store {}: {e}", config.database_url);
            return ExitCode::from(1);
        }
    };

    let sites = match store.list_enabled_sites(cli.siteid, cli.custid).await {
        Ok(sites) => sites,
        Err(e) => {
            eprintln!("failed to list sites: {e}");
            return ExitCode::from(1);
        }
    };
    if sites.is_empty() {
        println!("no enabled sites match the given filters");
        return ExitCode::SUCCESS;
    }

    println!(
        "starting {} site job(s) in {} mode ({} parallel)",
        sites.len(),
        config.crawl_mode,
        config.max_parallel_sites
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, draining in-flight work");
                cancel.cancel();
            }
        });
    }

    let scheduler = Scheduler::new(config.clone(), store);
    let outcomes = scheduler.run(sites, cancel).await;

    let mut failed = 0;
    for outcome in &outcomes {
        println!(
            "site {} job {}: {}{}",
            outcome.site_id,
            outcome.job_id,
            outcome.status.as_str(),
            outcome
                .error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
        if !outcome.is_completed() {
            failed += 1;
        }
    }

    if failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

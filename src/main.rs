//! linkreach CLI
//!
//! Loads the app config, runs every configured account through the session
//! pool and prints a per-account summary. Ctrl-C requests a graceful stop:
//! in-flight waits and invite batches observe the cancel flag and wind down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use linkreach::inbox::{HttpInboxClient, SecondFactorSource};
use linkreach::pool::{ChromiumFactory, WorkerPool};
use linkreach::runner::SessionOutcome;
use linkreach::store::FileSessionStore;
use linkreach::{init_logging, log_dir, AppConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logging();

    info!("Starting linkreach");
    if let Some(dir) = log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let config = AppConfig::load();
    let accounts = config.valid_accounts();
    if accounts.is_empty() {
        // Materialize the config file so there is something to edit
        config.save();
        error!("No runnable accounts; add accounts to the config file and retry");
        anyhow::bail!("no accounts configured");
    }

    let store = Arc::new(FileSessionStore::open("linkreach")?);
    let factory = Arc::new(ChromiumFactory::new(config.headless, config.chrome_path.clone()));

    let code_source: Option<Arc<dyn SecondFactorSource>> = match &config.inbox {
        Some(inbox_config) => match HttpInboxClient::new(inbox_config.clone()) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!("Inbox client unavailable, second-factor logins will fail: {}", e);
                None
            }
        },
        None => None,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing in-flight work and stopping");
            cancel_for_signal.store(true, Ordering::Relaxed);
        }
    });

    let pool = WorkerPool::new(config.pool_config(), cancel);
    let reports = pool.run(factory, store, accounts, code_source).await;

    let mut succeeded = 0usize;
    for report in &reports {
        match &report.outcome {
            SessionOutcome::Completed { records_written } => {
                succeeded += 1;
                let sent = report
                    .invites
                    .iter()
                    .filter(|i| i.outcome == linkreach::throttle::InviteOutcome::Sent)
                    .count();
                info!(
                    "{}: {} records, {} invites sent",
                    report.identity, records_written, sent
                );
            }
            SessionOutcome::LoginFailed(reason) => {
                error!("{}: login failed ({})", report.identity, reason);
            }
            SessionOutcome::PipelineError(reason) => {
                error!("{}: pipeline failed ({})", report.identity, reason);
            }
        }
    }

    info!("Done: {}/{} sessions succeeded", succeeded, reports.len());

    if succeeded == 0 && !reports.is_empty() {
        anyhow::bail!("all sessions failed");
    }
    Ok(())
}

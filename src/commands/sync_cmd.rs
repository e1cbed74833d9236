//! Sync CLI commands for synchronizing with the server.

use clap::{Args, Subcommand};

use todosync::{SyncContext, SyncSummary};

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and server status
    Status,

    /// Keep syncing in the background until interrupted
    Watch,
}

impl SyncCommand {
    pub async fn run(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None => self.sync(ctx).await,
            Some(SyncSubcommand::Status) => self.status(ctx).await,
            Some(SyncSubcommand::Watch) => self.watch(ctx).await,
        }
    }

    async fn sync(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        let engine = ctx.engine()?;

        println!("Syncing with server...");
        println!();

        match engine.reconcile().await? {
            Some(summary) => print_summary(&summary),
            None => println!("Another sync is already running."),
        }
        Ok(())
    }

    async fn status(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let settings = ctx.settings();
        let tracker = ctx.tracker();
        let pending = tracker.count().await?;
        let deletes = tracker.tombstone_count().await?;

        let Some(server_url) = settings.server_url.as_deref() else {
            println!("Status: Not configured (working offline)");
            println!("Pending changes: {}", pending);
            println!("Pending deletes: {}", deletes);
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    server_url: \"http://localhost:8080\"");
            println!();
            println!("Or set the environment variable TODOSYNC_SERVER_URL");
            return Ok(());
        };

        println!("Server:          {}", server_url);
        println!("Poll interval:   {}s", settings.poll_interval().as_secs());
        println!(
            "Streaming:       {}",
            if settings.streaming { "enabled" } else { "disabled" }
        );
        println!("Conflicts:       {}", settings.conflict_policy);
        println!("Pending changes: {}", pending);
        println!("Pending deletes: {}", deletes);
        println!();

        print!("Server status: ");
        match ctx.remote()?.last_change().await {
            Ok(timestamp) => println!("✓ reachable (last change {})", format_millis(timestamp)),
            Err(e) if e.is_connectivity() => println!("✗ unreachable"),
            Err(e) => println!("✗ error: {}", e),
        }
        Ok(())
    }

    async fn watch(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        let agent = ctx.start_agent()?;
        let mut reachability = ctx.monitor().watch();

        println!(
            "Watching {} (Ctrl-C to stop)",
            ctx.settings().server_url.as_deref().unwrap_or_default()
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = reachability.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reachable = *reachability.borrow_and_update();
                    println!("{}", if reachable { "● online" } else { "○ offline" });
                }
            }
        }

        agent.shutdown();
        println!("Stopped.");
        Ok(())
    }
}

fn print_summary(summary: &SyncSummary) {
    if !summary.remote_reachable {
        println!("Server unreachable, nothing synced.");
        println!("{} change(s) waiting.", summary.residual_pending);
        return;
    }

    println!("  deletes pushed:     {}", summary.deletes_pushed);
    println!(
        "  changes pushed:     {} ({} failed)",
        summary.pending_pushed, summary.pending_failed
    );
    println!(
        "  new items pushed:   {} ({} failed)",
        summary.local_pushed, summary.local_push_failed
    );
    if summary.pending_discarded > 0 {
        println!("  changes overridden: {}", summary.pending_discarded);
    }
    println!("  items updated:      {}", summary.pulled_updated);
    println!("  items pulled:       {}", summary.pulled_inserted);
    println!("  items removed:      {}", summary.deleted_locally);
    println!(
        "  documents:          {} pushed, {} pulled",
        summary.documents_pushed, summary.documents_pulled
    );
    println!();

    if summary.is_noop() {
        println!("Already up to date.");
    } else {
        println!("Sync complete: {}.", summary);
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

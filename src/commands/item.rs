use clap::{Args, Subcommand};

use super::{truncate, OutputFormat};
use todosync::SyncContext;

#[derive(Args)]
pub struct ItemCommand {
    #[command(subcommand)]
    pub command: ItemSubcommand,
}

#[derive(Subcommand)]
pub enum ItemSubcommand {
    /// Create a new item
    Add {
        /// Title of the item
        title: String,
    },

    /// List all items
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Mark an item as completed
    Complete {
        /// Item ID
        id: String,

        /// Mark as not completed instead
        #[arg(long)]
        undo: bool,
    },

    /// Delete an item
    Delete {
        /// Item ID
        id: String,
    },
}

impl ItemCommand {
    pub async fn run(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        let replica = ctx.replica();

        match &self.command {
            ItemSubcommand::Add { title } => {
                if title.trim().is_empty() {
                    return Err("Item title cannot be empty".into());
                }
                let item = replica.create_item(title.trim()).await?;
                println!("Created item:");
                println!("{}", item);
                print_offline_hint(ctx);
                Ok(())
            }

            ItemSubcommand::List { format } => {
                let items = replica.list_items().await?;

                if items.is_empty() {
                    println!("No items found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&items)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<26}  {:<4}  TITLE", "ID", "DONE");
                        println!("{}", "-".repeat(72));
                        for item in &items {
                            let done = if item.completed { "x" } else { "" };
                            println!("{:<26}  {:<4}  {}", item.id, done, truncate(&item.title, 40));
                        }
                        println!("\nTotal: {} item(s)", items.len());
                    }
                }
                Ok(())
            }

            ItemSubcommand::Complete { id, undo } => {
                let item = replica.set_completed(id, !undo).await?;
                println!("{}", item);
                print_offline_hint(ctx);
                Ok(())
            }

            ItemSubcommand::Delete { id } => {
                if replica.delete_item(id).await? {
                    println!("Deleted item {}", id);
                } else {
                    println!("Item {} was not stored locally; delete queued for the server", id);
                }
                print_offline_hint(ctx);
                Ok(())
            }
        }
    }
}

fn print_offline_hint(ctx: &SyncContext) {
    if ctx.settings().is_configured() && !ctx.monitor().is_reachable() {
        println!("(server unreachable, change saved locally and will sync later)");
    }
}

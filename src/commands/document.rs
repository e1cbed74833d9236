use clap::{Args, Subcommand};

use super::{truncate, OutputFormat};
use todosync::SyncContext;

#[derive(Args)]
pub struct DocCommand {
    #[command(subcommand)]
    pub command: DocSubcommand,
}

#[derive(Subcommand)]
pub enum DocSubcommand {
    /// Create a new document
    Add {
        /// Document title
        title: String,

        /// Document content
        #[arg(long)]
        content: Option<String>,
    },

    /// List all documents
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a document and its content
    Show {
        /// Document ID
        id: String,
    },
}

impl DocCommand {
    pub async fn run(&self, ctx: &SyncContext) -> Result<(), Box<dyn std::error::Error>> {
        let replica = ctx.replica();

        match &self.command {
            DocSubcommand::Add { title, content } => {
                if title.trim().is_empty() {
                    return Err("Document title cannot be empty".into());
                }
                let (document, body) = replica
                    .create_document(title.trim(), content.as_deref())
                    .await?;
                println!("Created document {} ({})", document.title, document.id);
                if body.is_some() {
                    println!("  with content");
                }
                Ok(())
            }

            DocSubcommand::List { format } => {
                let documents = replica.list_documents().await?;

                if documents.is_empty() {
                    println!("No documents found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&documents)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<26}  {:<40}  CREATED", "ID", "TITLE");
                        println!("{}", "-".repeat(90));
                        for document in &documents {
                            println!(
                                "{:<26}  {:<40}  {}",
                                document.id,
                                truncate(&document.title, 40),
                                document.created_at.format("%Y-%m-%d %H:%M")
                            );
                        }
                        println!("\nTotal: {} document(s)", documents.len());
                    }
                }
                Ok(())
            }

            DocSubcommand::Show { id } => {
                let document = replica
                    .get_document(id)
                    .await?
                    .ok_or_else(|| format!("Document not found: {}", id))?;

                println!("{}", document.title);
                println!("{}", "=".repeat(document.title.chars().count().max(1)));
                println!("ID:      {}", document.id);
                println!("Created: {}", document.created_at.format("%Y-%m-%d %H:%M"));
                println!();
                match replica.document_body(id).await? {
                    Some(body) => println!("{}", body.content),
                    None => println!("(no content)"),
                }
                Ok(())
            }
        }
    }
}

use clap::ValueEnum;

mod config_cmd;
mod document;
mod item;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use document::DocCommand;
pub use item::ItemCommand;
pub use sync_cmd::SyncCommand;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Cuts `text` to `width` characters, marking the cut with "...".
pub(crate) fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() > width {
        let kept: String = text.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}

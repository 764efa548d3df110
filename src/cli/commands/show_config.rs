use anyhow::Result;
use std::path::PathBuf;

use super::{Command, CommandContext};

pub struct ShowConfigCommand {
    pub write: Option<PathBuf>,
}

impl Command for ShowConfigCommand {
    async fn execute(&self, ctx: &CommandContext) -> Result<bool> {
        match &self.write {
            Some(path) => {
                ctx.config.save_to_file(path)?;
                println!("✅ Configuration written to {}", path.display());
            }
            None if ctx.json => println!("{}", serde_json::to_string_pretty(ctx.config.as_ref())?),
            None => print!("{}", toml::to_string_pretty(ctx.config.as_ref())?),
        }
        Ok(true)
    }
}

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::execution::ExecutionResult;
use crate::external::Toolchain;
use crate::shutdown::ShutdownCoordinator;

pub mod monitor;
pub mod patch;
pub mod rollback;
pub mod show_config;

/// Everything a command needs, built once in `main`
#[derive(Clone)]
pub struct CommandContext {
    pub config: Arc<EngineConfig>,
    pub tools: Toolchain,
    pub shutdown: ShutdownCoordinator,
    pub json: bool,
}

/// Commands report whether the run succeeded; `main` maps that to the exit code
#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self, ctx: &CommandContext) -> Result<bool>;
}

#[derive(Serialize)]
struct JsonResult<'a, T: Serialize> {
    success: bool,
    message: &'a str,
    error_kind: Option<&'static str>,
    error: Option<String>,
    data: Option<&'a T>,
}

/// Print a result as JSON, or the headline plus whatever `details` renders
pub fn report<T: Serialize>(ctx: &CommandContext, result: &ExecutionResult<T>, details: impl Fn(&T)) -> Result<bool> {
    if ctx.json {
        let payload = JsonResult {
            success: result.success,
            message: &result.message,
            error_kind: result.error.as_ref().map(|e| e.kind()),
            error: result.error.as_ref().map(|e| e.to_string()),
            data: result.data.as_ref(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(result.success);
    }

    if result.success {
        println!("✅ {}", result.message);
    } else {
        println!("❌ {}", result.message);
        if let Some(error) = &result.error {
            println!("   {}: {error}", error.kind());
        }
    }
    if let Some(data) = &result.data {
        details(data);
    }
    Ok(result.success)
}

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use patchkeeper::cli::commands::monitor::MonitorCommand;
use patchkeeper::cli::commands::patch::PatchCommand;
use patchkeeper::cli::commands::rollback::RollbackCommand;
use patchkeeper::cli::commands::show_config::ShowConfigCommand;
use patchkeeper::cli::commands::{Command, CommandContext};
use patchkeeper::cli::{Cli, Commands};
use patchkeeper::config::EngineConfig;
use patchkeeper::external::{ProcessCommandExecutor, Toolchain};
use patchkeeper::orchestrator::PatchFlags;
use patchkeeper::rollback::RollbackParams;
use patchkeeper::shutdown::ShutdownCoordinator;
use patchkeeper::telemetry::init_telemetry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let cli = Cli::parse();

    EngineConfig::load_env_file()?;
    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config = config.with_root(root);
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_telemetry(&config.logging)?;

    let config = Arc::new(config);
    let executor = Arc::new(ProcessCommandExecutor::new());
    let ctx = CommandContext {
        tools: Toolchain::from_config(&config, executor),
        config,
        shutdown: ShutdownCoordinator::new(),
        json: cli.json,
    };

    let success = tokio::runtime::Runtime::new()?.block_on(async {
        let success = run(cli.command, &ctx).await;
        ctx.shutdown.shutdown(SHUTDOWN_GRACE).await;
        success
    })?;

    std::process::exit(if success { 0 } else { 1 });
}

async fn run(command: Commands, ctx: &CommandContext) -> Result<bool> {
    match command {
        Commands::Patch {
            description,
            files,
            base,
            force,
            skip_validation,
            no_review,
            auto_merge,
            dry_run,
            monitor,
            ticket,
            create_ticket,
            install_missing,
            command,
        } => {
            let flags = PatchFlags {
                force,
                skip_validation,
                create_review: !no_review,
                auto_merge,
                dry_run,
                install_missing,
                create_ticket,
            };
            PatchCommand::new(description)
                .with_files(files)
                .with_base(base)
                .with_flags(flags)
                .with_ticket(ticket)
                .with_monitor(monitor)
                .with_command(command)
                .execute(ctx)
                .await
        }
        Commands::Rollback {
            target,
            revision,
            files,
            backup,
            force,
            validate,
        } => {
            let params = RollbackParams {
                revision,
                files,
                create_backup: backup,
                force,
                validate_after: validate,
            };
            RollbackCommand::parse(&target, params)?.execute(ctx).await
        }
        Commands::Monitor {
            review_id,
            ticket,
            branch,
        } => {
            MonitorCommand {
                review_id,
                ticket,
                branch,
            }
            .execute(ctx)
            .await
        }
        Commands::Config { write } => ShowConfigCommand { write }.execute(ctx).await,
    }
}

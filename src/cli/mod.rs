use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "patchkeeper")]
#[command(about = "Branch, commit, push and review patches with automatic recovery")]
#[command(long_about = "Patchkeeper applies a change on a fresh branch, resolves remote divergence, \
                       opens a review request and watches it until merge. Every step can be rolled \
                       back, and 'patchkeeper rollback' recovers the working tree on demand.")]
pub struct Cli {
    /// Configuration file (defaults to patchkeeper.toml in the current directory)
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Project root the engine operates on
    #[arg(long, global = true, help = "Repository root (overrides repository.root)")]
    pub root: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true, help = "Emit machine-readable JSON instead of text")]
    pub json: bool,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true, help = "Log at debug level unless RUST_LOG is set")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply a change on a new branch, push it and open a review
    Patch {
        /// Human-readable description; its first line becomes the review title
        description: String,
        /// Files to stage (repeatable); the whole tree is staged when omitted
        #[arg(long = "file", value_name = "PATH", help = "Stage only this file (repeatable)")]
        files: Vec<String>,
        /// Base branch for the patch branch
        #[arg(long, help = "Branch to start from (defaults to repository.default_base_branch)")]
        base: Option<String>,
        #[arg(long, help = "Proceed despite a dirty tree or overridable safety warnings")]
        force: bool,
        #[arg(long, help = "Skip the post-apply validation command")]
        skip_validation: bool,
        #[arg(long, help = "Push the branch but do not open a review request")]
        no_review: bool,
        #[arg(long, help = "Request auto-merge once the review opens")]
        auto_merge: bool,
        #[arg(long, help = "Log every intended action without changing anything")]
        dry_run: bool,
        #[arg(long, help = "Keep running and monitor the review after it opens")]
        monitor: bool,
        /// Link an existing tracking ticket
        #[arg(long, help = "Tracking ticket closed once the review merges")]
        ticket: Option<u64>,
        #[arg(long, help = "Open a tracking ticket when --ticket is not given")]
        create_ticket: bool,
        #[arg(long, help = "Install missing CLIs with tools.install_commands")]
        install_missing: bool,
        /// Command run in the project root as the change itself
        #[arg(
            long,
            num_args = 1..,
            allow_hyphen_values = true,
            value_name = "PROGRAM [ARGS]...",
            help = "Run this command as the change; without it, existing working-tree changes are committed"
        )]
        command: Vec<String>,
    },
    /// Roll the working tree back to a known-good state
    Rollback {
        /// last-commit, last-working-state, specific-revision, selective-files or emergency
        target: String,
        #[arg(long, help = "Revision for specific-revision")]
        revision: Option<String>,
        #[arg(long = "file", value_name = "PATH", help = "File to restore for selective-files (repeatable)")]
        files: Vec<String>,
        #[arg(long, help = "Back up critical files and git state first")]
        backup: bool,
        #[arg(long, help = "Override overridable safety warnings; local changes are stashed")]
        force: bool,
        #[arg(long, help = "Check required files and run the validation command afterwards")]
        validate: bool,
    },
    /// Monitor an open review until it merges, closes or runs out of time
    Monitor {
        /// Review request number
        review_id: u64,
        #[arg(long, help = "Tracking ticket to close on merge")]
        ticket: Option<u64>,
        #[arg(long, help = "Patch branch (looked up from the review when omitted)")]
        branch: Option<String>,
    },
    /// Show the effective configuration
    Config {
        #[arg(long, value_name = "PATH", help = "Write the effective configuration to this file")]
        write: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_arguments() {
        let cli = Cli::try_parse_from([
            "patchkeeper",
            "patch",
            "fix: typo",
            "--file",
            "readme.txt",
            "--file",
            "docs/guide.md",
            "--dry-run",
            "--ticket",
            "7",
            "--command",
            "sed",
            "-i",
            "s/wrold/world/",
            "readme.txt",
        ])
        .unwrap();

        match cli.command {
            Commands::Patch {
                description,
                files,
                dry_run,
                ticket,
                command,
                ..
            } => {
                assert_eq!(description, "fix: typo");
                assert_eq!(files, vec!["readme.txt", "docs/guide.md"]);
                assert!(dry_run);
                assert_eq!(ticket, Some(7));
                assert_eq!(command, vec!["sed", "-i", "s/wrold/world/", "readme.txt"]);
            }
            _ => panic!("expected patch"),
        }
    }

    #[test]
    fn test_rollback_arguments_and_global_flags() {
        let cli = Cli::try_parse_from([
            "patchkeeper",
            "rollback",
            "specific-revision",
            "--revision",
            "abc1234",
            "--backup",
            "--json",
        ])
        .unwrap();

        assert!(cli.json);
        match cli.command {
            Commands::Rollback {
                target,
                revision,
                backup,
                force,
                ..
            } => {
                assert_eq!(target, "specific-revision");
                assert_eq!(revision.as_deref(), Some("abc1234"));
                assert!(backup);
                assert!(!force);
            }
            _ => panic!("expected rollback"),
        }
    }

    #[test]
    fn test_monitor_requires_review_id() {
        assert!(Cli::try_parse_from(["patchkeeper", "monitor"]).is_err());
        assert!(Cli::try_parse_from(["patchkeeper", "monitor", "42", "--ticket", "7"]).is_ok());
    }
}

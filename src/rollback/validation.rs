//! Post-rollback integrity check. Findings are warnings: the rollback has
//! already happened by the time this runs.

use tracing::warn;

use crate::config::EngineConfig;
use crate::external::CommandExecutor;

pub async fn validate_after_rollback(config: &EngineConfig, executor: &dyn CommandExecutor) -> Vec<String> {
    let mut warnings = Vec::new();

    for file in &config.rollback.required_files {
        if !config.repository.root.join(file).exists() {
            warnings.push(format!("required file '{file}' is missing after rollback"));
        }
    }

    if let Some((program, args)) = config
        .rollback
        .validation_command
        .as_ref()
        .and_then(|command| command.split_first())
    {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match executor.execute(program, &args, &config.repository.root).await {
            Ok(output) if output.success() => {}
            Ok(output) => warnings.push(format!(
                "validation command `{program}` exited with {}: {}",
                output.status_code,
                output.stderr.trim()
            )),
            Err(e) => warnings.push(format!("validation command `{program}` could not run: {e}")),
        }
    }

    for warning in &warnings {
        warn!(%warning, "Post-rollback validation");
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{CommandOutput, ScriptedCommandExecutor};

    #[tokio::test]
    async fn test_missing_required_file_and_failing_command_are_warnings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.txt"), "ok").unwrap();
        let mut config = EngineConfig::default().with_root(dir.path());
        config.rollback.required_files = vec!["present.txt".to_string(), "gone.txt".to_string()];
        config.rollback.validation_command = Some(vec!["cargo".to_string(), "check".to_string()]);
        let executor = ScriptedCommandExecutor::new().expect_command(
            "cargo",
            &["check"],
            CommandOutput::failed(101, "error[E0432]: unresolved import"),
        );

        let warnings = validate_after_rollback(&config, &executor).await;

        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("gone.txt"));
        assert!(warnings[1].contains("unresolved import"));
    }

    #[tokio::test]
    async fn test_clean_validation_has_no_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::default().with_root(dir.path());

        let warnings = validate_after_rollback(&config, &ScriptedCommandExecutor::new()).await;

        assert!(warnings.is_empty());
    }
}

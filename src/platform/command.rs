use std::process::Command;

use anyhow::{Context, Result};
use log::debug;

/// Captured result of one external program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr, trimmed. Several Windows tools print their
    /// errors on stdout.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr);
        }
        text
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Runs and returns the combined output, failing on a non-zero exit.
    fn run_combined(&self, program: &str, args: &[String]) -> Result<String> {
        let output = self.run(program, args)?;
        if !output.success {
            anyhow::bail!(
                "{} exited with {}: {}",
                program,
                output
                    .code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                output.combined()
            );
        }
        Ok(output.combined())
    }
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("[command] {} ({} args)", program, args.len());
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute {program}"))?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(CommandOutput);

    impl CommandRunner for Canned {
        fn run(&self, _program: &str, _args: &[String]) -> Result<CommandOutput> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn combined_joins_both_streams() {
        let output = CommandOutput {
            success: false,
            code: Some(1),
            stdout: "  The parameter is incorrect.\r\n".into(),
            stderr: "usage\n".into(),
        };
        assert_eq!(output.combined(), "The parameter is incorrect.\nusage");
    }

    #[test]
    fn run_combined_fails_on_non_zero_exit() {
        let failing = Canned(CommandOutput {
            success: false,
            code: Some(87),
            stdout: "bad".into(),
            stderr: String::new(),
        });
        let err = failing.run_combined("netsh", &[]).unwrap_err();
        assert!(err.to_string().contains("exited with 87: bad"));

        let ok = Canned(CommandOutput {
            success: true,
            code: Some(0),
            stdout: "done\n".into(),
            stderr: String::new(),
        });
        assert_eq!(ok.run_combined("netsh", &[]).unwrap(), "done");
    }
}

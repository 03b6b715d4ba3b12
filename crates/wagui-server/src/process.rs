use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// Captured result of an external command. Spawn failures surface as a
/// failed run whose stderr carries the error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn from_output(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }

    fn spawn_failed(err: std::io::Error) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: err.to_string(),
        }
    }

    /// stderr when present, else stdout, else `fallback`.
    pub fn failure_text(&self, fallback: &str) -> String {
        if !self.stderr.is_empty() {
            self.stderr.clone()
        } else if !self.stdout.is_empty() {
            self.stdout.clone()
        } else {
            fallback.to_string()
        }
    }
}

/// Runs a command line through the platform shell in `cwd`.
pub async fn run_shell(command_line: &str, cwd: &Path) -> CommandOutput {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(command_line);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(command_line);
        command
    };
    command.current_dir(cwd);
    match command.output().await {
        Ok(output) => CommandOutput::from_output(output),
        Err(err) => CommandOutput::spawn_failed(err),
    }
}

pub async fn run_git(args: &[&str], cwd: &Path) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|err| err.to_string())?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(format!("Command failed: git {}\n{stderr}", args.join(" ")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// First `max` lines of `text`, newline-joined.
pub fn head_lines(text: &str, max: usize) -> String {
    text.split('\n').take(max).collect::<Vec<_>>().join("\n")
}

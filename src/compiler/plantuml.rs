use super::{CompileError, CompileOutput, Compiler};
use crate::constants::{COMPILE_TIMEOUT, DEFAULT_PLANTUML_COMMAND, MAX_DIAGRAM_SIZE_BYTES};
use crate::diagram::{DiagramError, Image, ImageFormat};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Renders diagrams by running the PlantUML command-line tool.
///
/// The command may carry its own arguments, e.g. `java -jar plantuml.jar`.
#[derive(Clone, Debug)]
pub struct PlantUmlCompiler {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
}

impl Default for PlantUmlCompiler {
    fn default() -> Self {
        Self::new(DEFAULT_PLANTUML_COMMAND)
    }
}

impl PlantUmlCompiler {
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .unwrap_or_else(|| DEFAULT_PLANTUML_COMMAND.to_string());
        Self {
            program,
            base_args: parts.collect(),
            timeout: COMPILE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, format: ImageFormat) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg(format.plantuml_flag())
            .arg("-charset")
            .arg("UTF-8")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run_pipe(&self, text: &str, format: ImageFormat) -> Result<Output, CompileError> {
        let mut cmd = self.command(format);
        cmd.arg("-pipe").stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(CompileError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = text.as_bytes().to_vec();
            // Written concurrently so a renderer that streams output early
            // cannot block on a full stdout pipe.
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!("Renderer closed stdin early: {}", e);
                }
            });
        }

        Ok(child.wait_with_output().await?)
    }
}

#[async_trait]
impl Compiler for PlantUmlCompiler {
    async fn compile_to_image(
        &self,
        text: &str,
        format: ImageFormat,
        cancel: CancellationToken,
    ) -> Result<CompileOutput, CompileError> {
        if text.len() > MAX_DIAGRAM_SIZE_BYTES {
            return Err(CompileError::TooLarge(text.len()));
        }

        let start = Instant::now();
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompileError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.run_pipe(text, format)) => {
                res.map_err(|_| CompileError::Timeout(self.timeout))??
            }
        };
        tracing::debug!(
            "PlantUML render ({}) completed in {:.2}s",
            format,
            start.elapsed().as_secs_f64()
        );

        if output.status.success() && !output.stdout.is_empty() {
            return Ok(CompileOutput::rendered(Image::new(format, output.stdout)));
        }

        let errors = parse_error_report(&String::from_utf8_lossy(&output.stderr));
        if errors.is_empty() {
            return Err(CompileError::Failed(failure_message(&output)));
        }
        Ok(CompileOutput::rejected(errors))
    }

    async fn compile_to_file(&self, file: &Path, format: ImageFormat) -> Result<(), CompileError> {
        let mut cmd = self.command(format);
        cmd.arg(file).stdin(Stdio::null());
        let child = cmd.spawn().map_err(CompileError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CompileError::Timeout(self.timeout))??;

        if output.status.success() {
            tracing::info!("Rendered {:?} as {}", file, format);
            return Ok(());
        }

        let errors = parse_error_report(&String::from_utf8_lossy(&output.stderr));
        if errors.is_empty() {
            Err(CompileError::Failed(failure_message(&output)))
        } else {
            Err(CompileError::Diagram(errors))
        }
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let first = stderr.lines().find(|l| !l.trim().is_empty());
    match (first, output.status.code()) {
        (Some(line), _) => line.trim().to_string(),
        (None, Some(code)) => format!("exit status {}", code),
        (None, None) => "terminated by signal".to_string(),
    }
}

/// Parses PlantUML error output.
///
/// PlantUML reports a syntax error as an `ERROR` line followed by the
/// 1-based line number and one or more message lines. Some versions prefix
/// the block with the file name and print several blocks in a row.
pub fn parse_error_report(stderr: &str) -> Vec<DiagramError> {
    let mut errors = Vec::new();
    let mut lines = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).peekable();

    while let Some(line) = lines.next() {
        if line != "ERROR" {
            continue;
        }
        let number = lines.peek().and_then(|l| l.parse::<usize>().ok());
        if number.is_some() {
            lines.next();
        }
        let mut message = Vec::new();
        while let Some(next) = lines.peek() {
            if *next == "ERROR" {
                break;
            }
            message.push(*next);
            lines.next();
        }
        let message = if message.is_empty() {
            "Syntax error".to_string()
        } else {
            message.join(" ")
        };
        errors.push(DiagramError::new(number, message));
    }
    errors
}

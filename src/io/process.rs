use crate::types::{PipelineError, PipelineResult};
use std::process::{Command, Output, Stdio};

/// Render a command line for log messages
pub fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().to_string()];
    parts.extend(command.get_args().map(|a| a.to_string_lossy().to_string()));
    parts.join(" ")
}

fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().to_string()
}

fn output_of(command: &mut Command) -> PipelineResult<Output> {
    log::debug!("Running: {}", describe(command));

    command
        .stdin(Stdio::null())
        .output()
        .map_err(|e| PipelineError::Launch {
            program: program_name(command),
            reason: e.to_string(),
        })
}

/// Run a command with captured output.
///
/// Fails on a non-zero exit status and on GDAL-style `ERROR` lines on stderr,
/// since some GDAL python utilities report errors but still exit with 0.
pub fn run_captured(command: &mut Command) -> PipelineResult<Output> {
    let output = output_of(command)?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let error_lines: Vec<&str> = stderr
        .lines()
        .filter(|line| line.trim_start().starts_with("ERROR"))
        .collect();

    if !output.status.success() || !error_lines.is_empty() {
        let reason = if error_lines.is_empty() {
            format!("{} ({})", output.status, stderr.trim())
        } else {
            error_lines.join("; ")
        };
        return Err(PipelineError::Process {
            program: program_name(command),
            reason,
        });
    }

    Ok(output)
}

/// Run a command with captured output, judging it by its exit status alone.
///
/// For tools whose stderr carries diagnostics about the data rather than
/// about the run, e.g. gdalinfo on a raster without valid pixels.
pub fn run_exit_checked(command: &mut Command) -> PipelineResult<Output> {
    let output = output_of(command)?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Err(PipelineError::Process {
            program: program_name(command),
            reason: format!("{} ({})", output.status, stderr.trim()),
        });
    }
    if !stderr.trim().is_empty() {
        log::debug!("{}: {}", program_name(command), stderr.trim());
    }

    Ok(output)
}

/// Run a command with inherited stdout/stderr so its progress stays visible.
/// Returns the exit status without interpreting it.
pub fn run_inherited(command: &mut Command) -> PipelineResult<std::process::ExitStatus> {
    log::info!("Running: {}", describe(command));

    command.status().map_err(|e| PipelineError::Launch {
        program: program_name(command),
        reason: e.to_string(),
    })
}

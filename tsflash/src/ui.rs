//! Progress bar styles and prompts shared by the commands.
use anyhow::Result;
use console::{StyledObject, style};
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::ProgressStyle;
use tsflash_core::machine::Phase;
use tsflash_core::write::Stage;

const BAR_CHARS: &str = "■ ";

/// Presents a final "Yes/No" confirmation to the user.
pub fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

pub fn decompress_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {bytes} ({bytes_per_sec}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Style of the single-target bar for one stage of a flash.
pub fn stage_style(stage: Stage) -> ProgressStyle {
    let template = match stage {
        Stage::Writing => {
            "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})"
        }
        Stage::Verifying => {
            "{prefix:12} [{elapsed_precise}] [{bar:40.magenta/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})"
        }
    };
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(BAR_CHARS)
}

pub fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Writing => "Writing",
        Stage::Verifying => "Verifying",
    }
}

/// Style of one port's line in the live view.
pub fn port_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:10} {msg:40} [{bar:30.cyan/black}] {bytes:>10}/{total_bytes:10} {bytes_per_sec:>12}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(BAR_CHARS)
}

pub fn phase_label(phase: &Phase) -> StyledObject<String> {
    let text = match phase {
        Phase::Failed(reason) => format!("failed: {reason}"),
        other => other.name().to_string(),
    };
    match phase {
        Phase::Flashing => style(text).cyan().bold(),
        Phase::Completed => style(text).green().bold(),
        Phase::Failed(_) => style(text).red().bold(),
        Phase::BootHandoff | Phase::AwaitingReenum => style(text).yellow(),
        Phase::Dispatchable | Phase::Settling | Phase::Classifying => style(text).blue(),
        Phase::Idle | Phase::Cooldown => style(text).dim(),
    }
}

//! `tsflash flash`: one image onto one device, through the engine only.
use crate::ui;
use crate::{FlashArgs, Outcome};
use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{HumanBytes, ProgressBar};
use std::time::{Duration, Instant};
use tsflash_core::cancel::CancelToken;
use tsflash_core::config::parse_block_size;
use tsflash_core::image::{ImageError, SourceImage, is_compressed};
use tsflash_core::write::{FlashEngine, FlashError, FlashOptions, Progress, Stage};

/// How often `--non-interactive` logs progress.
const LOG_INTERVAL: Duration = Duration::from_secs(5);

pub fn run(args: FlashArgs, cancel: CancelToken) -> Result<Outcome> {
    let block_size = parse_block_size(&args.block_size)?;
    let options = FlashOptions {
        block_size,
        verify: !args.no_verify,
        length: None,
    };
    options.validate()?;

    if !args.yes {
        if args.non_interactive {
            bail!("refusing to overwrite {} without --yes", args.target.display());
        }
        println!(
            "{} This will erase all data on '{}'.",
            style("WARNING:").red().bold(),
            args.target.display()
        );
        println!("  Device: {}", style(args.target.display()).cyan());
        println!("  Image:  {}", style(args.image.display()).cyan());
        println!();
        if !ui::confirm_operation("Are you sure you want to proceed?")? {
            println!("Write operation cancelled.");
            return Ok(Outcome::Success);
        }
        println!();
    }

    let interactive = !args.non_interactive;
    let image = match open_image(&args, interactive, &cancel) {
        Ok(image) => image,
        Err(ImageError::Cancelled(_)) => return Ok(Outcome::Cancelled),
        Err(e) => return Err(e.into()),
    };
    log::info!(
        "Image {} is {}",
        args.image.display(),
        HumanBytes(image.len())
    );

    let bar = if interactive {
        ProgressBar::new(0)
    } else {
        ProgressBar::hidden()
    };
    let on_progress = progress_reporter(bar.clone(), interactive);

    let engine = FlashEngine::new();
    let handle = engine.submit(
        image.into(),
        &args.target,
        options,
        cancel.clone(),
        on_progress,
    )?;

    match handle.wait_blocking() {
        Ok(report) => {
            bar.finish_with_message("done");
            println!(
                "\n✨ Successfully flashed {} with {} ({} in {:.1?}).",
                style(report.target.display()).cyan(),
                style(args.image.display()).cyan(),
                HumanBytes(report.bytes_written),
                report.elapsed,
            );
            if let Some(sha256) = report.sha256 {
                println!("   sha256: {}", style(sha256).dim());
            }
            Ok(Outcome::Success)
        }
        Err(e @ FlashError::Cancelled { .. }) => {
            bar.abandon_with_message("cancelled");
            eprintln!("\n{} {}", style("Cancelled:").yellow().bold(), e);
            Ok(Outcome::Cancelled)
        }
        Err(e) => {
            bar.abandon_with_message("❌ failed");
            Err(e).with_context(|| format!("flashing {}", args.target.display()))
        }
    }
}

fn open_image(
    args: &FlashArgs,
    interactive: bool,
    cancel: &CancelToken,
) -> Result<SourceImage, ImageError> {
    if !is_compressed(&args.image) {
        return SourceImage::open(&args.image);
    }

    log::info!("Decompressing {}", args.image.display());
    let spinner = if interactive {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    spinner.set_prefix("Decompress");
    spinner.set_style(ui::decompress_style());
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = SourceImage::open_with_progress(&args.image, cancel, |bytes| {
        spinner.set_position(bytes)
    });
    match &result {
        Ok(_) => spinner.finish_with_message("Decompression complete."),
        Err(_) => spinner.abandon_with_message("❌ Operation failed."),
    }
    result
}

/// Drives the bar, or logs every [`LOG_INTERVAL`] when there is no bar.
fn progress_reporter(bar: ProgressBar, interactive: bool) -> impl FnMut(Progress) + Send + 'static {
    let mut stage = None;
    let mut last_log = Instant::now();
    move |p: Progress| {
        if stage != Some(p.stage) {
            if stage.is_some() {
                bar.finish();
                bar.reset();
            }
            stage = Some(p.stage);
            bar.set_length(p.total);
            bar.set_prefix(ui::stage_label(p.stage));
            bar.set_style(ui::stage_style(p.stage));
        }
        bar.set_position(p.bytes);

        if !interactive && (last_log.elapsed() >= LOG_INTERVAL || p.bytes == p.total) {
            last_log = Instant::now();
            let verb = match p.stage {
                Stage::Writing => "Written",
                Stage::Verifying => "Verified",
            };
            log::info!(
                "{} {} of {} ({:.0}%)",
                verb,
                HumanBytes(p.bytes),
                HumanBytes(p.total),
                percent(p.bytes, p.total)
            );
        }
    }
}

fn percent(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        bytes as f64 * 100.0 / total as f64
    }
}

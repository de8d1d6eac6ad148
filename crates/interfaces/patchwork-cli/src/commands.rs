use crate::{DownloadArgs, RunContext};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use humansize::{format_size, DECIMAL};
use indicatif::{ProgressBar, ProgressStyle};
use patchwork_config::SUMMARY_FAILURE_LIMIT;
use patchwork_core::diff::FileStatus;
use patchwork_core::report::{BuildReport, RunReport};
use patchwork_core::Manifest;
use patchwork_pipeline::{
    CheckOutcome, CleanReport, DownloadOptions, PatchEngine, ProgressTracker, ScanStats,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Serialize)]
struct CheckedFile<'a> {
    path: &'a str,
    group: &'a str,
    status: FileStatus,
    expected_hash: &'a str,
    size: u64,
}

#[derive(Serialize)]
struct CheckExport<'a> {
    checked_at: String,
    game_dir: &'a Utf8Path,
    total: usize,
    outdated: usize,
    files: Vec<CheckedFile<'a>>,
    extraneous: Vec<&'a str>,
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn fetch_manifest(engine: &PatchEngine) -> Result<Manifest> {
    println!(":: Fetching manifest...");
    let manifest = engine
        .fetch_manifest()
        .await
        .context("Failed to fetch manifest")?;
    println!(
        "   {} files in {} archives ({})",
        manifest.len(),
        manifest.archives().len(),
        format_size(manifest.total_bytes(), DECIMAL)
    );
    Ok(manifest)
}

fn status_label(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Unchanged => "ok",
        FileStatus::Missing => "missing",
        FileStatus::Modified => "modified",
        FileStatus::ExtraneousLocal => "extraneous",
    }
}

pub async fn cmd_check(ctx: &RunContext, output: Option<Utf8PathBuf>) -> Result<CheckOutcome> {
    let engine = ctx.engine()?;
    let game_dir = ctx.validated_game_dir()?;
    println!(":: Checking {}", game_dir);

    let manifest = fetch_manifest(&engine).await?;

    let pb = spinner()?;
    let cb = {
        let pb = pb.clone();
        Box::new(move |stats: ScanStats| {
            pb.set_message(format!(
                "Scanned {}/{} files ({} hashed)",
                stats.files_scanned,
                stats.total_files,
                format_size(stats.bytes_hashed, DECIMAL)
            ));
        })
    };
    let outcome = engine.check(&manifest, Some(cb)).await?;
    pb.finish_and_clear();

    let mut groups: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for result in &outcome.results {
        let Some(entry) = manifest.get(&result.path) else {
            continue;
        };
        let counts = groups.entry(entry.group()).or_default();
        counts.0 += 1;
        if result.needs_fetch() {
            counts.1 += 1;
        }
    }

    println!("\n:: Check Result");
    for (group, (total, outdated)) in &groups {
        println!("   {:<12} {:>6} files, {:>6} outdated", group, total, outdated);
    }

    let mut outdated: Vec<_> = outcome.outdated().collect();
    outdated.sort_by_key(|r| (r.status != FileStatus::Modified, r.path.clone()));
    if !outdated.is_empty() {
        println!("\n   Outdated files:");
        for r in &outdated {
            println!("   [{:<8}] {}", status_label(r.status), r.path);
        }
    }
    if !outcome.extraneous.is_empty() {
        println!(
            "\n   {} staged files are not in the manifest:",
            outcome.extraneous.len()
        );
        for r in &outcome.extraneous {
            println!("   {}", r.path);
        }
    }

    if outdated.is_empty() {
        println!("\n   Status: Up to date");
    } else {
        println!(
            "\n   Status: {} files outdated (run `download` or `update`)",
            outdated.len()
        );
    }

    if let Some(out) = output {
        let export = CheckExport {
            checked_at: chrono::Utc::now().to_rfc3339(),
            game_dir,
            total: outcome.results.len(),
            outdated: outdated.len(),
            files: outcome
                .results
                .iter()
                .filter_map(|r| {
                    let entry = manifest.get(&r.path)?;
                    Some(CheckedFile {
                        path: &r.path,
                        group: entry.group(),
                        status: r.status,
                        expected_hash: &entry.hash,
                        size: entry.size,
                    })
                })
                .collect(),
            extraneous: outcome.extraneous.iter().map(|r| r.path.as_str()).collect(),
        };
        let json = serde_json::to_string_pretty(&export)?;
        std::fs::write(&out, json).with_context(|| format!("Failed to write {out}"))?;
        println!(":: Saved check results to {}", out);
    }

    Ok(outcome)
}

async fn run_download(
    engine: &PatchEngine,
    manifest: &Manifest,
    opts: &DownloadOptions,
) -> Result<RunReport> {
    let plan = engine.plan_download(manifest, opts.mode).await?;
    let total_bytes: u64 = plan.tasks.iter().map(|t| t.entry.size).sum();

    if plan.tasks.is_empty() {
        println!(":: All files are up to date");
        return Ok(engine.execute_download(plan, opts, None).await);
    }
    println!(
        ":: Downloading {} files ({}){}",
        plan.tasks.len(),
        format_size(total_bytes, DECIMAL),
        if opts.verify {
            ""
        } else {
            " without verification"
        }
    );

    let mut tracker = ProgressTracker::new(&plan.tasks);
    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ETA {eta} {msg}",
        )?
        .progress_chars("=>-"),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let download = engine.execute_download(plan, opts, Some(tx));
    let progress = async {
        while let Some(ev) = rx.recv().await {
            tracker.update(ev);
            let snap = tracker.snapshot();
            pb.set_position(snap.bytes_done);
            let current = snap
                .in_flight
                .first()
                .map(|a| a.file_name.as_str())
                .unwrap_or_default();
            pb.set_message(format!(
                "{}/{} files {}/s {}",
                snap.files_done + snap.files_failed,
                snap.files_total,
                format_size(snap.bytes_per_sec, DECIMAL),
                current
            ));
        }
    };
    let (report, ()) = tokio::join!(download, progress);
    pb.finish_and_clear();

    Ok(report)
}

pub fn print_run_summary(report: &RunReport, failure_threshold: f64) {
    println!("\n:: Download Summary");
    println!("   Updated:    {}", report.updated_count());
    println!("   Cached:     {}", report.cached.len());
    println!("   Unchanged:  {}", report.unchanged);
    if !report.skipped.is_empty() {
        println!("   Skipped:    {}", report.skipped.len());
    }
    if !report.unverified.is_empty() {
        println!("   Unverified: {}", report.unverified.len());
    }
    println!("   Failed:     {}", report.failed_count());
    println!(
        "   Downloaded: {}",
        format_size(report.bytes_downloaded, DECIMAL)
    );

    if !report.failed.is_empty() {
        println!("\n   Failed files:");
        for (path, reason) in report.failed.iter().take(SUMMARY_FAILURE_LIMIT) {
            println!("   {}: {}", path, reason);
        }
        if report.failed.len() > SUMMARY_FAILURE_LIMIT {
            println!(
                "   ... and {} more",
                report.failed.len() - SUMMARY_FAILURE_LIMIT
            );
        }
    }

    let mismatches = report.hash_mismatches();
    if mismatches > 0 {
        println!(
            "\n   {} files failed hash verification. The mirror may be serving a different \
             build than the manifest; try another --mirror or retry later.",
            mismatches
        );
    }
    if report.stale_mirror_suspected(failure_threshold) {
        println!(
            "   Warning: {:.0}% of attempted downloads failed; the mirror looks stale or unreachable.",
            report.failure_ratio() * 100.0
        );
    }
    if !report.extraneous.is_empty() {
        println!(
            "   {} staged files are no longer in the manifest",
            report.extraneous.len()
        );
    }
}

pub fn print_build_summary(report: &BuildReport) {
    println!("\n:: Build Summary");
    if report.built.is_empty() && report.failed.is_empty() {
        println!("   No archives needed rebuilding");
    }
    for archive in &report.built {
        println!("   Built    {}.mpq", archive);
    }
    for archive in &report.skipped {
        println!("   Skipped  {}.mpq (nothing staged)", archive);
    }
    for (archive, error) in &report.failed {
        println!("   FAILED   {}.mpq: {}", archive, error);
    }
}

pub async fn cmd_download(ctx: &RunContext, args: &DownloadArgs) -> Result<RunReport> {
    let engine = ctx.engine()?;
    let manifest = fetch_manifest(&engine).await?;
    let opts = args.options(&ctx.settings);

    let report = run_download(&engine, &manifest, &opts).await?;
    print_run_summary(&report, ctx.settings.failure_threshold);
    Ok(report)
}

pub async fn cmd_build(ctx: &RunContext, force: bool) -> Result<BuildReport> {
    let engine = ctx.engine()?;
    let manifest = fetch_manifest(&engine).await?;

    println!(
        ":: Building archives into {}{}",
        ctx.settings.output_dir,
        if force { " (forced)" } else { "" }
    );
    let report = engine.build(&manifest, None, force).await?;
    print_build_summary(&report);
    Ok(report)
}

pub async fn cmd_update(
    ctx: &RunContext,
    args: &DownloadArgs,
    force: bool,
) -> Result<(RunReport, BuildReport)> {
    let engine = ctx.engine()?;
    let manifest = fetch_manifest(&engine).await?;
    let opts = args.options(&ctx.settings);

    let report = run_download(&engine, &manifest, &opts).await?;
    print_run_summary(&report, ctx.settings.failure_threshold);

    println!("\n:: Building archives into {}", ctx.settings.output_dir);
    let built = engine.build(&manifest, Some(&report), force).await?;
    print_build_summary(&built);

    Ok((report, built))
}

pub fn cmd_clean(ctx: &RunContext) -> Result<CleanReport> {
    let engine = ctx.staging_engine()?;
    println!(
        ":: Cleaning {} and {}",
        ctx.settings.download_dir, ctx.settings.output_dir
    );
    let report = engine.clean()?;
    for path in &report.removed {
        println!("   Removed {}", path);
    }
    println!(
        "   {} files and {} directories removed",
        report.files_removed, report.dirs_removed
    );
    Ok(report)
}

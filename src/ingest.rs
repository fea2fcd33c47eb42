//! Bulk ingestion of local files into a subject.
//!
//! Explicit file arguments are always ingested. Directories are walked and
//! filtered by `[ingest].include_globs`, matched against the path relative
//! to the directory. Files are processed in sorted order so repeated runs
//! produce the same ingestion order.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::Config;
use crate::engine::AnswerEngine;
use crate::store::Upload;

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Expand `paths` into the list of files to ingest.
pub fn collect_files(paths: &[PathBuf], include_globs: &[String]) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(include_globs)?;
    let mut files = Vec::new();

    for path in paths {
        if path.is_file() {
            files.push(path.clone());
            continue;
        }
        if !path.is_dir() {
            bail!("Path does not exist: {}", path.display());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(path) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
            if include_set.is_match(relative) {
                found.push(entry.into_path());
            }
        }
        found.sort();
        files.extend(found);
    }

    files.dedup();
    Ok(files)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub async fn run_ingest(
    config: &Config,
    subject_id: &str,
    paths: &[PathBuf],
    dry_run: bool,
) -> Result<()> {
    if config.db.is_none() {
        bail!("ingest needs a [db] section in the config so documents persist");
    }

    let files = collect_files(paths, &config.ingest.include_globs)?;
    println!("Ingest: subject={}", subject_id);
    println!("  files: {}", files.len());

    if dry_run {
        for file in &files {
            println!("  would ingest: {}", file.display());
        }
        println!("ok (dry run)");
        return Ok(());
    }

    let mut uploads = Vec::with_capacity(files.len());
    for file in &files {
        let bytes =
            std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        uploads.push(Upload::new(display_name(file), bytes));
    }

    let engine = AnswerEngine::from_config(config).await?;
    let outcomes = engine.ingest_batch(subject_id, uploads).await;
    let outcomes = match outcomes {
        Ok(outcomes) => outcomes,
        Err(e) => {
            engine.close().await;
            return Err(e.into());
        }
    };

    let mut succeeded = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(doc) => {
                succeeded += 1;
                println!(
                    "  ok: {} ({} passages, id {})",
                    outcome.filename, doc.passage_count, doc.id
                );
            }
            Err(e) => println!("  failed: {} ({})", outcome.filename, e),
        }
    }
    println!("  ingested: {}/{}", succeeded, outcomes.len());

    engine.close().await;

    if succeeded == 0 && !outcomes.is_empty() {
        bail!("no files were ingested");
    }
    println!("ok");
    Ok(())
}

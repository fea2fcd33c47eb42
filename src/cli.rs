//! Command implementations for the `notes` binary.
//!
//! Each `run_*` function builds what it needs from the [`Config`], prints a
//! human-readable summary to stdout and closes the store before returning.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::engine::AnswerEngine;
use crate::models::{AnswerRecord, AnswerStyle, Query};
use crate::store::sqlite::SqliteBackend;

fn require_db(config: &Config, command: &str) -> Result<()> {
    if config.db.is_none() {
        bail!("`{}` needs a [db] section in the config", command);
    }
    Ok(())
}

/// Create the database file and apply migrations.
pub async fn run_init(config: &Config) -> Result<()> {
    let Some(db) = &config.db else {
        bail!("`init` needs a [db] section in the config");
    };
    let backend = SqliteBackend::open(&db.path).await?;
    backend.close().await;
    println!("Database initialized successfully.");
    println!("  path: {}", db.path.display());
    Ok(())
}

pub async fn run_subjects(config: &Config) -> Result<()> {
    let engine = AnswerEngine::from_config(config).await?;
    let subjects = engine.subjects();
    engine.close().await;

    if subjects.is_empty() {
        println!("No subjects.");
        return Ok(());
    }
    println!("{:<16} {:<24} {:>9} {:>9}", "ID", "NAME", "DOCUMENTS", "PASSAGES");
    for s in subjects {
        println!("{:<16} {:<24} {:>9} {:>9}", s.id, s.name, s.documents, s.passages);
    }
    Ok(())
}

pub async fn run_documents(config: &Config, subject_id: &str) -> Result<()> {
    require_db(config, "documents")?;
    let engine = AnswerEngine::from_config(config).await?;
    let documents = engine.documents(subject_id);
    engine.close().await;
    let documents = documents?;

    if documents.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in documents {
        let ingested = chrono::DateTime::from_timestamp(doc.ingested_at, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{}", doc.filename);
        println!("    id: {}", doc.id);
        println!("    type: {}  passages: {}  ingested: {}", doc.content_type, doc.passage_count, ingested);
    }
    Ok(())
}

pub async fn run_remove(config: &Config, document_id: &str) -> Result<()> {
    require_db(config, "remove")?;
    let engine = AnswerEngine::from_config(config).await?;
    let removed = engine.remove(document_id).await;
    engine.close().await;
    let doc = removed?;
    println!("Removed {} ({}) from {}", doc.filename, doc.id, doc.subject_id);
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    subject_id: &str,
    question: &str,
    teacher: bool,
    json: bool,
) -> Result<()> {
    let engine = AnswerEngine::from_config(config).await?;
    let style = if teacher {
        AnswerStyle::Teacher
    } else {
        AnswerStyle::Concise
    };
    let record = engine
        .ask(&Query::new(subject_id, question).with_style(style))
        .await;
    engine.close().await;
    let record = record?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_answer(&record);
    }
    Ok(())
}

fn print_answer(record: &AnswerRecord) {
    println!("{}", record.answer);
    println!();
    println!("Confidence: {}", record.confidence);
    if record.evidence.is_empty() {
        return;
    }
    println!();
    println!("Evidence:");
    for (i, evidence) in record.evidence.iter().enumerate() {
        println!("  [{}] {}", i + 1, evidence.citation.label());
        println!("      \"{}\"", evidence.snippet);
    }
}

//! Command implementations.

use crate::cli::{CliConfig, Command};
use async_trait::async_trait;
use std::path::Path;
use storyloom_core::{
    BatchOperation, BatchOptions, BatchSummary, CancellationFlag, CheckOptions, ContinuityIssue,
    CostEstimateOptions, IssueReviewer, NovelSession, Project, ProgressEvent, SessionConfig,
    WriteRequest,
};
use tokio::sync::mpsc;
use tracing::info;

type CliResult = Result<(), Box<dyn std::error::Error>>;

pub async fn run(config: CliConfig) -> CliResult {
    let mut session = NovelSession::from_env(SessionConfig::new());

    if let Some(path) = &config.project {
        session.load_project(Project::load(path).await?);
    } else if config.command != Command::Estimate {
        return Err("--project is required for this command".into());
    }

    if let Some(path) = &config.memory {
        session.load_memory(path).await?;
    }

    match config.command {
        Command::Batch(operation) => run_batch(&mut session, &config, operation).await?,
        Command::Write => run_write(&mut session, &config).await?,
        Command::Check => run_check(&session, &config).await?,
        Command::Estimate => run_estimate(&session, &config),
        Command::Export => run_export(&session, &config).await?,
        Command::Help => {}
    }

    if let Some(path) = &config.save_memory {
        session.save_memory(path).await?;
        info!(path = %path.display(), "memory saved");
    }

    let costs = session.costs();
    if costs.check_count > 0 {
        eprintln!(
            "[COST] ${:.4} over {} oracle calls ({} in / {} out tokens)",
            costs.total_cost, costs.check_count, costs.tokens.input, costs.tokens.output
        );
    }
    Ok(())
}

async fn run_batch(
    session: &mut NovelSession,
    config: &CliConfig,
    operation: BatchOperation,
) -> CliResult {
    let mut options = BatchOptions::new(operation).with_range(config.start, config.end);
    if let Some(size) = config.batch_size {
        options = options.with_batch_size(size);
    }
    if let Some(instruction) = &config.instruction {
        options = options.with_instruction(instruction.clone());
    }

    // Ctrl-C stops the run after the current chapter.
    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current chapter...");
            on_signal.cancel();
        }
    });

    let (mut tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx));
    let summary = session
        .process_full_novel(options, &mut tx, Some(cancel))
        .await;
    drop(tx);
    printer.await.ok();

    if config.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if let Some(manuscript) = &summary.manuscript {
        let Some(path) = &config.output else {
            eprintln!("Rewritten chapters were not saved; pass --output to keep them.");
            return Ok(());
        };
        let mut project = session.project().clone();
        project.manuscript = manuscript.clone();
        project.save(path).await?;
        println!("Rewritten project saved to {}", path.display());
    }
    Ok(())
}

async fn run_write(session: &mut NovelSession, config: &CliConfig) -> CliResult {
    let instruction = config
        .instruction
        .clone()
        .ok_or("--instruction is required for write")?;

    let mut request = WriteRequest::new(config.chapter, instruction)
        .with_auto_fix(config.auto_fix)
        .with_double_check(config.double_check)
        .with_sampling(config.sampled);
    if let Some(words) = config.words {
        request = request.with_target_words(words);
    }

    let (mut tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx));
    let outcome = session
        .write_chapter_reviewed(request, &TerminalReviewer, &mut tx)
        .await;
    drop(tx);
    printer.await.ok();

    if config.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    for issue in &outcome.issues {
        println!("[ISSUE] {}", issue.as_fix_instruction());
    }
    for warning in &outcome.warnings {
        println!("[WARN] {warning}");
    }
    if outcome.cancelled {
        println!("Cancelled.");
        return Ok(());
    }
    if let Some(error) = &outcome.error {
        return Err(format!("Generation failed: {error}").into());
    }

    if let Some(content) = &outcome.content {
        write_or_print(config.output.as_deref(), content).await?;
    }
    if let Some(audit) = &outcome.audit {
        for issue in &audit.issues {
            println!("[AUDIT] {}", issue.as_fix_instruction());
        }
        if audit.cleared {
            println!("[AUDIT] cleared");
        }
    }
    Ok(())
}

async fn run_check(session: &NovelSession, config: &CliConfig) -> CliResult {
    let planned = config
        .instruction
        .clone()
        .ok_or("--instruction is required for check")?;

    let report = session
        .check_continuity(config.chapter, &planned, &CheckOptions::default())
        .await;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !report.checked {
        println!("Not checked.");
    } else if report.cleared {
        println!("Cleared.");
    }
    for issue in &report.issues {
        println!("[ISSUE] {}", issue.as_fix_instruction());
        if let Some(detail) = &issue.detail {
            println!("        {detail}");
        }
    }
    for warning in &report.warnings {
        println!("[WARN] {warning}");
    }
    Ok(())
}

fn run_estimate(session: &NovelSession, config: &CliConfig) {
    let chapters = config
        .chapters
        .or_else(|| {
            let n = session.project().chapters().len() as u32;
            (n > 0).then_some(n)
        })
        .unwrap_or(CostEstimateOptions::default().chapters);

    let estimate = session.estimate_cost(&CostEstimateOptions {
        chapters,
        check_interval: session.config().check_interval,
        ..CostEstimateOptions::default()
    });

    println!("Chapters:        {chapters}");
    println!(
        "Deep checks:     {} (${:.2})",
        estimate.deep_checks, estimate.deep_check_total
    );
    println!(
        "Creative calls:  {} (${:.2})",
        estimate.creative_calls, estimate.creative_total
    );
    println!("Estimated total: ${:.2}", estimate.total);
}

async fn run_export(session: &NovelSession, config: &CliConfig) -> CliResult {
    let json = serde_json::to_string_pretty(&session.export_memory())?;
    write_or_print(config.output.as_deref(), &json).await
}

async fn write_or_print(path: Option<&Path>, content: &str) -> CliResult {
    match path {
        Some(path) => {
            tokio::fs::write(path, content).await?;
            println!("Saved to {}", path.display());
        }
        None => println!("{content}"),
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match (event.current, event.total) {
            (Some(current), Some(total)) => eprintln!("[{current}/{total}] {}", event.message),
            _ => eprintln!("... {}", event.message),
        }
    }
}

fn print_summary(summary: &BatchSummary) {
    println!("{}", summary.summary);
    for batch in &summary.batches {
        let first = batch.chapters.first().copied().unwrap_or_default();
        let last = batch.chapters.last().copied().unwrap_or_default();
        println!(
            "  Chapters {first}-{last}: {}",
            batch.summary.as_deref().unwrap_or("(no analysis)")
        );
        if !batch.failed.is_empty() {
            println!("    failed: {:?}", batch.failed);
        }
    }
    for issue in &summary.issues {
        let chapter = issue
            .chapter
            .map(|c| format!("ch. {c}"))
            .unwrap_or_else(|| "general".to_string());
        println!(
            "  [{chapter}] {}: {}",
            issue.issue_type.as_deref().unwrap_or("issue"),
            issue.detail.as_deref().unwrap_or("")
        );
    }
    if summary.cancelled {
        println!("Run was cancelled.");
    }
    println!(
        "Cost: ${:.4} in {:.1}s",
        summary.cost,
        summary.elapsed_ms as f64 / 1000.0
    );
}

/// Asks on the terminal whether to write despite issues.
struct TerminalReviewer;

#[async_trait]
impl IssueReviewer for TerminalReviewer {
    async fn approve(&self, chapter: u32, issues: &[ContinuityIssue]) -> bool {
        eprintln!("Chapter {chapter} has {} continuity issue(s):", issues.len());
        for issue in issues {
            eprintln!("  - {}", issue.as_fix_instruction());
        }
        eprint!("Write anyway? [y/N] ");

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;

        matches!(answer, Ok(Ok(line)) if line.trim().eq_ignore_ascii_case("y"))
    }
}

use crate::models::{SlotStatus, TokenUsage, slot_label};
use crate::runner::{SessionReport, SlotReport, TargetReport};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format options
#[derive(Debug, Clone, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Print a session report in the specified format
pub fn print_report(report: &SessionReport, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", render_plain(report)),
        OutputFormat::Json => print_json(report),
    }
}

fn format_usage(usage: &TokenUsage) -> String {
    format!(
        "{} prompt + {} completion = {} tokens",
        usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
    )
}

fn format_cost(cost: Option<f64>) -> String {
    match cost {
        Some(cost) => format!("${:.4}", cost),
        None => "n/a".to_string(),
    }
}

fn render_slot(out: &mut String, slot: &SlotReport, max_total: f64) {
    out.push_str(&format!("{} ({}) [{}]\n", slot.label, slot.model, slot.status));
    if let Some(total) = slot.total_score {
        out.push_str(&format!("Score: {:.1}/{:.0}\n", total, max_total));
    }
    out.push_str(&format!(
        "Usage: {} | est. cost {}\n",
        format_usage(&slot.usage),
        format_cost(slot.estimated_cost)
    ));
    if let SlotStatus::Errored { message } = &slot.status {
        out.push_str(&format!("Error: {}\n", message));
    }
    if slot.output.is_empty() {
        out.push_str("(no output)\n");
    } else {
        out.push_str(&slot.output);
        out.push('\n');
    }
    out.push('\n');
}

fn render_target(out: &mut String, target: &TargetReport) {
    out.push_str(&format!("=== {} ===\n", target.name));
    out.push_str(&format!("Status: {}\n\n", target.status));

    for slot in &target.slots {
        render_slot(out, slot, target.max_total);
    }

    if let Some(judged) = &target.judge_result {
        out.push_str(&format!("Verdict: {}\n", target.verdict));
        out.push_str(&format!("Reasoning: {}\n", judged.winner_reasoning));
        for verdict in &judged.slots {
            let label = target
                .slots
                .get(verdict.slot_index)
                .map(|s| s.label.as_str())
                .unwrap_or("?");
            let scores: Vec<String> = verdict
                .scores
                .iter()
                .map(|(key, score)| format!("{key} {score:.1}"))
                .collect();
            out.push_str(&format!("  • {}: {}\n", label, scores.join(", ")));
        }
        out.push_str(&format!("Judge usage: {}\n", format_usage(&target.judge_usage)));
    }

    for warning in &target.warnings {
        out.push_str(&format!("Warning: {}\n", warning));
    }
    out.push('\n');
}

/// Render the report as plain text
pub fn render_plain(report: &SessionReport) -> String {
    let mut out = String::new();
    for target in &report.targets {
        render_target(&mut out, target);
    }

    out.push_str(&format!("{}\n", "=".repeat(50)));
    for (index, usage) in report.usage.models.iter().enumerate() {
        out.push_str(&format!("Model {}: {}\n", slot_label(index), format_usage(usage)));
    }
    out.push_str(&format!("Judge: {}\n", format_usage(&report.usage.judge)));
    out.push_str(&format!("Total: {}\n", format_usage(&report.usage.total)));
    out.push_str(&format!("Estimated cost: {}\n", format_cost(report.estimated_cost)));
    if report.cancelled {
        out.push_str("Run cancelled before all targets finished.\n");
    }
    out
}

/// Print results in JSON format
fn print_json(report: &SessionReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

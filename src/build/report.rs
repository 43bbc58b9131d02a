//! Best-effort Markdown report over whatever a build produced

use super::artifacts::{context_path, generation_path, ArtifactWriter, GeneratedSection, SectionStatus};
use super::{BuildRecord, StageStatus};
use crate::assemble::AssembledContext;
use crate::error::Result;
use crate::llm::section_title;

/// Render `report.md`. Sections without grounded context, or whose text was
/// not generated, are marked as such rather than left out.
pub fn render_report(
    record: &BuildRecord,
    writer: &ArtifactWriter,
    intents: &[String],
) -> Result<String> {
    let mut out = String::new();

    out.push_str(&format!("# Valuation report: {}\n\n", record.ticker_set.join(", ")));
    out.push_str(&format!("- Build: `{}`\n", record.build_id));
    out.push_str(&format!("- Scope: `{}`\n", record.scope));
    out.push_str(&format!("- State: {}\n", record.state));
    out.push_str(&format!(
        "- Started: {}\n",
        record.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!("- Config: `{}`\n\n", &record.config_fingerprint[..record.config_fingerprint.len().min(12)]));

    out.push_str("## Stages\n\n");
    out.push_str("| Stage | Status | Attempts | Detail |\n");
    out.push_str("|---|---|---|---|\n");
    for (stage, stage_record) in &record.stage_statuses {
        let detail = match stage_record.status {
            StageStatus::Completed => stage_record.notes.first().cloned().unwrap_or_default(),
            _ => stage_record.reason.clone().unwrap_or_default(),
        };
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            stage,
            stage_record.status,
            stage_record.attempts,
            detail.replace('|', "\\|")
        ));
    }
    out.push('\n');

    for ticker in &record.ticker_set {
        out.push_str(&format!("## {}\n\n", ticker));
        for intent in intents {
            out.push_str(&format!("### {}\n\n", section_title(intent)));

            let context: Option<AssembledContext> =
                writer.read_json(&context_path(ticker, intent))?;
            let section: Option<GeneratedSection> =
                writer.read_json(&generation_path(ticker, intent))?;

            render_section(&mut out, context.as_ref(), section.as_ref());
        }
    }

    Ok(out)
}

fn render_section(
    out: &mut String,
    context: Option<&AssembledContext>,
    section: Option<&GeneratedSection>,
) {
    let Some(context) = context else {
        out.push_str("_Not available: no context was assembled for this section._\n\n");
        return;
    };

    if context.no_data {
        out.push_str("> **No grounded context.** No filing passages were retrieved for this section.\n\n");
    }

    match section {
        Some(s) if s.status == SectionStatus::Generated => {
            if !s.grounded {
                out.push_str("> **Ungrounded.** Generated without filing passages.\n\n");
            }
            if let Some(ref text) = s.text {
                out.push_str(text.trim());
                out.push_str("\n\n");
            }
        }
        Some(s) => {
            let label = match s.status {
                SectionStatus::Failed => "Generation failed",
                _ => "Generation skipped",
            };
            out.push_str(&format!(
                "_{}: {}_\n\n",
                label,
                s.reason.as_deref().unwrap_or("no reason recorded")
            ));
        }
        None if !context.no_data => {
            out.push_str("_No generated text; retrieved passages are listed below._\n\n");
        }
        None => {}
    }

    if !context.citation_index.is_empty() {
        out.push_str("Sources:\n\n");
        for citation in &context.citation_index {
            out.push_str(&format!("- {}\n", citation.render()));
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::StageName;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record() -> BuildRecord {
        let mut record = BuildRecord::new(
            "default",
            vec!["ACME".to_string(), "NEWCO".to_string()],
            &[StageName::Assemble],
            "0123456789abcdef",
            Utc::now(),
        );
        for stage in [StageName::Ingest, StageName::Chunk, StageName::Embed, StageName::Index] {
            record.start_stage(stage, Utc::now()).unwrap();
            record.complete_stage(stage, vec![], Utc::now()).unwrap();
        }
        record.start_stage(StageName::Retrieve, Utc::now()).unwrap();
        record
            .fail_stage(StageName::Retrieve, "generation backend unavailable: down", Utc::now())
            .unwrap();
        record.finalize(Utc::now()).unwrap();
        record
    }

    #[test]
    fn test_missing_and_empty_sections_are_marked() {
        let temp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(temp.path());
        writer
            .write_json(
                &context_path("NEWCO", "risk_factors"),
                &AssembledContext::empty("risk_factors", "NEWCO", 6000),
            )
            .unwrap();

        let report =
            render_report(&record(), &writer, &["risk_factors".to_string()]).unwrap();

        assert!(report.contains("# Valuation report: ACME, NEWCO"));
        assert!(report.contains("| retrieve | failed | 1 | generation backend unavailable: down |"));
        assert!(report.contains("| assemble | skipped | 0 | blocked by retrieve stage |"));
        assert!(report.contains("_Not available: no context was assembled for this section._"));
        assert!(report.contains("**No grounded context.**"));
    }

    #[test]
    fn test_generated_ungrounded_section() {
        let temp = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(temp.path());
        writer
            .write_json(
                &context_path("NEWCO", "cash_flow"),
                &AssembledContext::empty("cash_flow", "NEWCO", 6000),
            )
            .unwrap();
        writer
            .write_json(
                &generation_path("NEWCO", "cash_flow"),
                &GeneratedSection {
                    ticker: "NEWCO".to_string(),
                    intent_label: "cash_flow".to_string(),
                    status: SectionStatus::Generated,
                    grounded: false,
                    text: Some("Free cash flow was negative.".to_string()),
                    model: Some("llama3".to_string()),
                    reason: None,
                },
            )
            .unwrap();

        let report = render_report(&record(), &writer, &["cash_flow".to_string()]).unwrap();
        assert!(report.contains("### Cash Flow"));
        assert!(report.contains("**Ungrounded.**"));
        assert!(report.contains("Free cash flow was negative."));
    }
}

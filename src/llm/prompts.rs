//! Prompt templates for report sections

use crate::assemble::PromptPayload;

/// Human-readable heading of an intent
pub fn section_title(intent_label: &str) -> String {
    match intent_label {
        "revenue_outlook" => "Revenue Outlook".to_string(),
        "profitability" => "Profitability".to_string(),
        "cash_flow" => "Cash Flow".to_string(),
        "guidance" => "Management Guidance".to_string(),
        "risk_factors" => "Risk Factors".to_string(),
        other => other.replace('_', " "),
    }
}

/// Prompt for one analysis section of a report
pub struct SectionPrompt;

impl SectionPrompt {
    /// Render the payload into a single completion prompt. Grounded payloads
    /// demand bracketed citation markers; ungrounded ones demand a disclaimer.
    pub fn render(payload: &PromptPayload) -> String {
        let mut prompt = String::new();

        prompt.push_str(SECTION_SYSTEM_PROMPT);
        prompt.push('\n');

        prompt.push_str("## Task\n\n");
        prompt.push_str(&format!("**Company:** {}\n", payload.ticker));
        prompt.push_str(&format!(
            "**Section:** {}\n\n",
            section_title(&payload.intent_label)
        ));

        if !payload.financial_context.is_empty() {
            prompt.push_str("## Structured Metrics\n\n");
            for line in &payload.financial_context {
                prompt.push_str(&format!("- {}\n", line));
            }
            prompt.push('\n');
        }

        if payload.grounded {
            prompt.push_str("## Source Passages\n\n");
            for (citation, passage) in payload.citations.iter().zip(&payload.passages) {
                prompt.push_str(&format!("{}\n```\n{}\n```\n\n", citation, passage));
            }
            prompt.push_str(GROUNDED_INSTRUCTIONS);
        } else {
            prompt.push_str(UNGROUNDED_INSTRUCTIONS);
        }

        prompt
    }
}

const SECTION_SYSTEM_PROMPT: &str = r#"You are an equity research analyst writing one section of a valuation report.

You will be given:
1. The company and the section to write
2. Structured financial metrics, when available
3. Numbered source passages from the company's filings, when available
"#;

const GROUNDED_INSTRUCTIONS: &str = r#"## Instructions

Write the section in 2-4 short paragraphs of plain Markdown.

Guidelines:
- Use only facts stated in the source passages or the structured metrics
- Cite every factual sentence with the bracketed marker of its passage, e.g. [1] or [2][3]
- Do not invent figures, dates or events that the passages do not contain
- If the passages do not support a conclusion, say so

Respond ONLY with the section text, no heading.
"#;

const UNGROUNDED_INSTRUCTIONS: &str = r#"## Instructions

No filing passages are available for this section.

Guidelines:
- Begin with the sentence "No filing passages were available for this section."
- Use only the structured metrics above, if any; do not draw on outside knowledge of the company
- Keep it to one short paragraph

Respond ONLY with the section text, no heading.
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(grounded: bool) -> PromptPayload {
        PromptPayload {
            intent_label: "risk_factors".to_string(),
            ticker: "ACME".to_string(),
            grounded,
            citations: if grounded {
                vec!["[1] ACME 10-K 2024-02-15 (3f9a1c2e)".to_string()]
            } else {
                Vec::new()
            },
            passages: if grounded {
                vec!["We face intense competition.".to_string()]
            } else {
                Vec::new()
            },
            financial_context: vec!["debt_to_equity=2.4".to_string()],
        }
    }

    #[test]
    fn test_grounded_prompt_requires_citations() {
        let prompt = SectionPrompt::render(&payload(true));

        assert!(prompt.contains("**Section:** Risk Factors"));
        assert!(prompt.contains("[1] ACME 10-K 2024-02-15 (3f9a1c2e)"));
        assert!(prompt.contains("We face intense competition."));
        assert!(prompt.contains("bracketed marker"));
        assert!(prompt.contains("- debt_to_equity=2.4"));
    }

    #[test]
    fn test_ungrounded_prompt_has_no_passages() {
        let prompt = SectionPrompt::render(&payload(false));

        assert!(!prompt.contains("## Source Passages"));
        assert!(prompt.contains("No filing passages were available"));
    }

    #[test]
    fn test_section_titles() {
        assert_eq!(section_title("cash_flow"), "Cash Flow");
        assert_eq!(section_title("custom_intent"), "custom intent");
    }
}

//! Flattening of captured blobs into plain text
//!
//! Paragraph structure is kept as blank lines so the chunker can find
//! boundaries. Output is a pure function of the input bytes.

use super::DocumentFormat;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use std::collections::BTreeMap;

/// Wrap width handed to the HTML renderer
const HTML_WIDTH: usize = 100;

/// Normalize a captured blob according to its format
pub fn normalize(format: DocumentFormat, raw: &str) -> String {
    let text = match format {
        DocumentFormat::Text => raw.to_string(),
        DocumentFormat::Markdown => markdown_to_text(raw),
        DocumentFormat::Html => html2text::from_read(raw.as_bytes(), HTML_WIDTH),
        DocumentFormat::Csv => price_rows_to_text(raw),
    };
    tidy(&text)
}

/// Line endings, trailing spaces, runs of blank lines
fn tidy(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n").replace('\0', "");
    let mut out = String::with_capacity(unified.len());
    let mut blank_run = 0usize;

    for line in unified.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim_end().to_string()
}

fn markdown_to_text(md: &str) -> String {
    let mut out = String::new();

    for event in Parser::new(md) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak => out.push(' '),
            Event::HardBreak => out.push('\n'),
            Event::Start(Tag::Item) => out.push_str("- "),
            Event::End(TagEnd::TableCell) => out.push_str(" | "),
            Event::End(TagEnd::Item) | Event::End(TagEnd::TableRow) | Event::End(TagEnd::TableHead) => {
                out.push('\n')
            }
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::CodeBlock)
            | Event::End(TagEnd::List(_))
            | Event::End(TagEnd::Table) => out.push_str("\n\n"),
            Event::Rule => out.push_str("\n\n"),
            _ => {}
        }
    }

    out
}

/// One parsed price row: date plus numeric columns
#[derive(Debug, Clone, PartialEq)]
pub struct PriceRow {
    pub date: String,
    pub values: BTreeMap<String, f64>,
}

/// Parse a simple `date,col,col...` CSV. Non-numeric cells are dropped.
pub fn parse_price_rows(raw: &str) -> Vec<PriceRow> {
    let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<String> = match lines.next() {
        Some(h) => h.split(',').map(|c| c.trim().to_ascii_lowercase()).collect(),
        None => return Vec::new(),
    };

    let mut rows = Vec::new();
    for line in lines {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let Some(date) = cells.first() else { continue };

        let values = header
            .iter()
            .zip(cells.iter())
            .skip(1)
            .filter_map(|(name, cell)| cell.parse::<f64>().ok().map(|v| (name.clone(), v)))
            .collect();

        rows.push(PriceRow {
            date: date.to_string(),
            values,
        });
    }

    rows
}

fn price_rows_to_text(raw: &str) -> String {
    parse_price_rows(raw)
        .iter()
        .map(|row| {
            let fields: Vec<String> = row
                .values
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{}: {}", row.date, fields.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_tidy() {
        let raw = "Item 1A.  \r\n\r\n\r\n\r\nRisk Factors\r\nMore text   ";
        assert_eq!(
            normalize(DocumentFormat::Text, raw),
            "Item 1A.\n\nRisk Factors\nMore text"
        );
    }

    #[test]
    fn test_markdown_keeps_paragraphs() {
        let md = "# Item 7\n\nRevenue grew\nstrongly.\n\n- Cloud\n- Devices\n";
        let text = normalize(DocumentFormat::Markdown, md);

        assert!(text.starts_with("Item 7\n\nRevenue grew strongly."));
        assert!(text.contains("- Cloud\n- Devices"));
        assert!(!text.contains('#'));
    }

    #[test]
    fn test_html_strips_markup() {
        let html = "<html><body><p>Net sales increased.</p><p>Margins held.</p></body></html>";
        let text = normalize(DocumentFormat::Html, html);

        assert!(text.contains("Net sales increased."));
        assert!(text.contains("Margins held."));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_price_rows() {
        let csv = "Date,Close,Volume\n2024-01-02,185.5,1000\n2024-01-03,187.25,n/a\n";
        let rows = parse_price_rows(csv);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values["close"], 185.5);
        assert!(!rows[1].values.contains_key("volume"));

        let text = normalize(DocumentFormat::Csv, csv);
        assert_eq!(text, "2024-01-02: close=185.5 volume=1000\n2024-01-03: close=187.25");
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let md = "## Liquidity\n\nCash was $4.2B.";
        assert_eq!(
            normalize(DocumentFormat::Markdown, md),
            normalize(DocumentFormat::Markdown, md)
        );
    }
}

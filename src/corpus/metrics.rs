//! Structured financial context attached to a ticker

use super::normalize::PriceRow;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured metrics that parameterize query planning and back
/// metrics-only report sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinancialContext {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    /// Named numeric metrics, e.g. `revenue_growth`, `free_cash_flow`
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl FinancialContext {
    /// Name used in query text: company name when known, else the ticker
    pub fn subject<'a>(&'a self, ticker: &'a str) -> &'a str {
        self.company_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(ticker)
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.company_name.is_none() && self.fiscal_year.is_none() && self.metrics.is_empty()
    }

    /// Fold price-series rows in as `latest_close` and `period_return`.
    /// Metrics already present (from `metrics.json`) win.
    pub fn absorb_price_rows(&mut self, rows: &[PriceRow]) {
        let mut closes: Vec<(&str, f64)> = rows
            .iter()
            .filter_map(|r| r.values.get("close").map(|c| (r.date.as_str(), *c)))
            .collect();
        closes.sort_by(|a, b| a.0.cmp(b.0));

        let (Some(first), Some(last)) = (closes.first(), closes.last()) else {
            return;
        };

        self.metrics
            .entry("latest_close".to_string())
            .or_insert(last.1);
        if first.1 != 0.0 && closes.len() > 1 {
            self.metrics
                .entry("period_return".to_string())
                .or_insert((last.1 - first.1) / first.1);
        }
    }

    /// Deterministic `name=value` lines for prompts and reports
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(ref name) = self.company_name {
            lines.push(format!("company_name={}", name));
        }
        if let Some(year) = self.fiscal_year {
            lines.push(format!("fiscal_year={}", year));
        }
        for (k, v) in &self.metrics {
            lines.push(format!("{}={}", k, v));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::normalize::parse_price_rows;

    #[test]
    fn test_subject_falls_back_to_ticker() {
        let mut ctx = FinancialContext::default();
        assert_eq!(ctx.subject("ACME"), "ACME");

        ctx.company_name = Some("Acme Corp".to_string());
        assert_eq!(ctx.subject("ACME"), "Acme Corp");
    }

    #[test]
    fn test_absorb_price_rows() {
        let rows = parse_price_rows("date,close\n2024-01-03,110\n2024-01-02,100\n");
        let mut ctx = FinancialContext::default();
        ctx.absorb_price_rows(&rows);

        assert_eq!(ctx.metric("latest_close"), Some(110.0));
        assert!((ctx.metric("period_return").unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_metrics_win() {
        let rows = parse_price_rows("date,close\n2024-01-02,100\n");
        let mut ctx = FinancialContext::default();
        ctx.metrics.insert("latest_close".to_string(), 42.0);
        ctx.absorb_price_rows(&rows);

        assert_eq!(ctx.metric("latest_close"), Some(42.0));
        assert_eq!(ctx.metric("period_return"), None);
    }
}

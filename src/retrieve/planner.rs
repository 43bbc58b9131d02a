//! Deterministic intent expansion

use super::{RetrievalQuery, KNOWN_INTENTS};
use crate::corpus::FinancialContext;
use crate::error::{PipelineError, Result};

/// Facets and domain keywords of one analysis intent
#[derive(Debug)]
pub struct IntentProfile {
    pub label: &'static str,
    /// Ordered sub-query facets; each becomes one query
    pub facets: &'static [&'static str],
    /// Terms whose presence in a passage earns the keyword boost
    pub keywords: &'static [&'static str],
}

const INTENTS: &[IntentProfile] = &[
    IntentProfile {
        label: "revenue_outlook",
        facets: &[
            "revenue growth drivers",
            "segment and product revenue trends",
            "pricing and customer demand",
            "backlog and bookings",
        ],
        keywords: &[
            "revenue", "sales", "growth", "demand", "segment", "pricing", "backlog", "customers",
        ],
    },
    IntentProfile {
        label: "profitability",
        facets: &[
            "gross margin trends",
            "operating expenses and operating leverage",
            "net income and earnings per share",
        ],
        keywords: &[
            "margin", "gross", "operating", "income", "earnings", "expenses", "profit", "share",
        ],
    },
    IntentProfile {
        label: "cash_flow",
        facets: &[
            "cash flow from operating activities",
            "capital expenditures",
            "liquidity and capital resources",
            "share repurchases and dividends",
        ],
        keywords: &[
            "cash", "flow", "capital", "expenditures", "liquidity", "dividends", "repurchases",
            "debt",
        ],
    },
    IntentProfile {
        label: "guidance",
        facets: &[
            "management guidance and outlook",
            "forward-looking statements",
            "expected results for the next fiscal year",
        ],
        keywords: &[
            "guidance", "outlook", "expect", "forecast", "anticipate", "forward", "fiscal",
            "target",
        ],
    },
    IntentProfile {
        label: "risk_factors",
        facets: &[
            "litigation and legal proceedings risk",
            "regulatory and compliance risk",
            "competition risk",
            "supply chain and operational risk",
            "macroeconomic and currency risk",
        ],
        keywords: &[
            "risk", "litigation", "regulatory", "competition", "supply", "uncertainty",
            "adverse", "legal",
        ],
    },
];

/// Look up the built-in profile of an intent
pub fn intent_profile(label: &str) -> Option<&'static IntentProfile> {
    INTENTS.iter().find(|profile| profile.label == label)
}

/// Extra facets switched on by structured metrics
fn metric_facets(intent: &str, context: &FinancialContext) -> Vec<&'static str> {
    let below = |name: &str, limit: f64| context.metric(name).is_some_and(|v| v < limit);
    let above = |name: &str, limit: f64| context.metric(name).is_some_and(|v| v > limit);

    let mut facets = Vec::new();
    match intent {
        "revenue_outlook" if below("revenue_growth", 0.0) => {
            facets.push("causes of revenue decline");
        }
        "profitability" if below("operating_margin", 0.0) => {
            facets.push("path to profitability and cost reductions");
        }
        "cash_flow" if below("free_cash_flow", 0.0) => {
            facets.push("funding needs and financing activities");
        }
        "risk_factors" => {
            if above("debt_to_equity", 2.0) {
                facets.push("leverage and debt covenant risk");
            }
            if below("period_return", -0.2) {
                facets.push("drivers of share price decline");
            }
        }
        _ => {}
    }
    facets
}

/// Expands an intent into sub-queries
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Deterministically expand `intent_label` for `ticker`. The fixed facets
    /// come first in catalog order, then metric-conditioned facets.
    pub fn plan(
        &self,
        intent_label: &str,
        ticker: &str,
        context: &FinancialContext,
    ) -> Result<Vec<RetrievalQuery>> {
        let profile = intent_profile(intent_label).ok_or_else(|| {
            PipelineError::Config(format!(
                "unknown intent '{}' (known: {})",
                intent_label,
                KNOWN_INTENTS.join(", ")
            ))
        })?;

        let subject = context.subject(ticker);
        let period = context
            .fiscal_year
            .map(|year| format!(" fiscal {}", year))
            .unwrap_or_default();

        let queries = profile
            .facets
            .iter()
            .copied()
            .chain(metric_facets(intent_label, context))
            .enumerate()
            .map(|(i, facet)| RetrievalQuery {
                query_id: format!("{}:{}:{}", ticker, intent_label, i),
                ticker: ticker.to_string(),
                intent_label: intent_label.to_string(),
                query_text: format!("{} {}{}", subject, facet, period),
            })
            .collect();

        Ok(queries)
    }
}

//! Status-dependent guidance shown on money request reports
use serde::{Deserialize, Serialize};

use crate::policy::Policy;
use crate::report::Report;
use crate::types::StatusNum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextStepType {
    Neutral,
    Alert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStepMessage {
    pub text: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl NextStepMessage {
    fn plain(text: &str) -> Self {
        Self { text: text.to_string(), kind: None }
    }
    fn strong(text: &str) -> Self {
        Self {
            text: text.to_string(),
            kind: Some("strong".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStep {
    #[serde(rename = "type")]
    pub kind: NextStepType,
    pub title: String,
    pub message: Vec<NextStepMessage>,
}

impl NextStep {
    pub fn text(&self) -> String {
        self.message.iter().map(|m| m.text.as_str()).collect()
    }
}

/// Guidance for `report` once it reaches `predicted_status`.
pub fn build_next_step(report: &Report, policy: Option<&Policy>, predicted_status: StatusNum) -> NextStep {
    let submit_and_close = policy.is_some_and(Policy::is_submit_and_close);
    let instant_submit = policy.is_some_and(Policy::is_instant_submit_enabled);

    let (kind, message) = match predicted_status {
        StatusNum::Open if instant_submit => (
            NextStepType::Neutral,
            vec![
                NextStepMessage::plain("Waiting for "),
                NextStepMessage::strong("you"),
                NextStepMessage::plain(" to add expenses. They will submit automatically."),
            ],
        ),
        StatusNum::Open => (
            NextStepType::Alert,
            vec![
                NextStepMessage::plain("Waiting for "),
                NextStepMessage::strong("you"),
                NextStepMessage::plain(" to submit these expenses."),
            ],
        ),
        StatusNum::Submitted => (
            NextStepType::Alert,
            vec![
                NextStepMessage::plain("Waiting for "),
                NextStepMessage::strong("an approver"),
                NextStepMessage::plain(" to approve these expenses."),
            ],
        ),
        StatusNum::Approved => (
            NextStepType::Neutral,
            vec![
                NextStepMessage::plain("Waiting for "),
                NextStepMessage::strong("a payer"),
                NextStepMessage::plain(" to pay these expenses."),
            ],
        ),
        StatusNum::Closed if submit_and_close => (
            NextStepType::Neutral,
            vec![NextStepMessage::plain("No further action required!")],
        ),
        StatusNum::Closed => (
            NextStepType::Neutral,
            vec![NextStepMessage::plain("This report is closed.")],
        ),
        StatusNum::Reimbursed => (
            NextStepType::Neutral,
            vec![NextStepMessage::plain("No further action required!")],
        ),
    };

    let title = if report.is_invoice_report() { "Invoice" } else { "Next Steps:" };
    NextStep {
        kind,
        title: title.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ReportType;

    #[test]
    fn submitted_reports_wait_for_approver() {
        let report = Report {
            report_id: "1".into(),
            report_type: ReportType::Expense,
            ..Default::default()
        };
        let step = build_next_step(&report, None, StatusNum::Submitted);
        assert_eq!(step.kind, NextStepType::Alert);
        assert!(step.text().contains("approver"));
    }
}

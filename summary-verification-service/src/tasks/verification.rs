use async_trait::async_trait;
use graph_flow::{Context, NextAction, Task, TaskResult};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::types::{generation_failed, load_document, load_run, session_keys};
use super::utils::SourceText;
use crate::{
    error::GenerationStage,
    llm::TextGenerator,
    models::{FeedbackEntry, FeedbackStatus, MismatchDetail, Verdict, VerificationStatus},
    storage::DocumentStore,
};

pub(crate) const VERIFIER_PREAMBLE: &str = "You are a fact-checking auditor. The source article is the only source of truth. \
You compare a summary against it claim by claim and report every discrepancy as JSON.";

pub const UNPARSABLE_VERDICT_ERROR: &str =
    "Verifier response could not be parsed; the summary is treated as unverified";
const REJECTED_WITHOUT_DETAILS: &str = "Verifier rejected the summary without listing discrepancies";

const VERIFICATION_INSTRUCTIONS: &str = r#"Extract every atomic claim from the SUMMARY (each number, date, name and factual statement) and locate direct textual support for it in the SOURCE.

A summary is INVALID if any ONE of these errors is present:
- digit_change: a number or date differs from the source by even one character.
- name_change: a person, organization or place name is spelled differently from the source.
- hallucination: a claim has no locatable support anywhere in the source.
- context_omission: a true number is stated without qualifying context from the source that changes its meaning (for example a percentage without its comparison baseline).

Respond **only** with JSON of this exact form:
{
  "isValid": true or false,
  "errors": ["one human-readable description per discrepancy"],
  "mismatchDetails": [
    {"type": "digit_change|name_change|hallucination|context_omission", "claimInSummary": "...", "sourceEvidence": "... or null", "explanation": "..."}
  ],
  "claimsChecked": 0,
  "claimsVerified": 0,
  "claimsRejected": 0,
  "fabricatedClaims": ["claims from the summary with no support in the source"]
}
"isValid" must be true only when "errors" is empty."#;

/// One verification attempt: call the verifier, record the entry, persist.
pub struct VerificationTask {
    generator: Arc<dyn TextGenerator>,
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl VerificationTask {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        store: Arc<dyn DocumentStore>,
        max_attempts: u32,
    ) -> Self {
        Self {
            generator,
            store,
            max_attempts,
        }
    }

    /// Transport failures are returned as errors. An answer that cannot be
    /// interpreted is not an error: it degrades to an unparsable verdict.
    pub async fn check(
        &self,
        source: SourceText<'_>,
        summary: &str,
        attempt: u32,
    ) -> anyhow::Result<Verdict> {
        info!(attempt, "Verifying summary against source");

        let prompt = build_verification_prompt(source, summary, attempt);
        let raw = self.generator.generate(VERIFIER_PREAMBLE, &prompt).await?;
        let verdict = parse_verdict(&raw);

        info!(
            attempt,
            is_valid = verdict.is_valid,
            errors = verdict.errors.len(),
            claims_checked = verdict.claims_checked,
            "Verification finished"
        );
        Ok(verdict)
    }
}

#[async_trait]
impl Task for VerificationTask {
    fn id(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let document = load_document(&context)?;
        let mut run = load_run(&context)?;

        run.attempt_count += 1;
        let attempt = run.attempt_count;

        let verdict = self
            .check(SourceText::from(&document), &run.summary, attempt)
            .await
            .map_err(|e| {
                generation_failed(&run.document_id, GenerationStage::Verification, attempt, e)
            })?;

        if verdict.status == FeedbackStatus::Pending {
            warn!(
                document_id = %run.document_id,
                attempt,
                "Unreadable verdict recorded as a rejection"
            );
        }

        run.history.push(FeedbackEntry::from_verdict(attempt, &verdict));
        run.status = if verdict.is_valid {
            VerificationStatus::Verified
        } else if attempt >= self.max_attempts {
            VerificationStatus::ManualReview
        } else {
            VerificationStatus::Pending
        };
        run.last_verdict = Some(verdict);

        run.persist(self.store.as_ref()).await?;

        let status_message = match run.status {
            VerificationStatus::Verified => {
                info!(document_id = %run.document_id, attempt, "Summary verified");
                "verified"
            }
            VerificationStatus::ManualReview => {
                warn!(
                    document_id = %run.document_id,
                    attempt,
                    "Attempts exhausted, summary needs manual review"
                );
                "attempts exhausted"
            }
            _ => "rejected, correcting",
        };

        context.set(session_keys::RUN, run).await?;
        Ok(TaskResult::new_with_status(
            None,
            NextAction::Continue,
            Some(status_message.to_string()),
        ))
    }
}

fn build_verification_prompt(source: SourceText<'_>, summary: &str, attempt: u32) -> String {
    format!(
        "Verification attempt {attempt}.\n\n{instructions}\n\n{header}\n\nSOURCE:\n{content}\n\nSUMMARY:\n{summary}",
        instructions = VERIFICATION_INSTRUCTIONS,
        header = source.header(),
        content = source.content,
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    #[serde(alias = "is_valid")]
    is_valid: bool,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default, alias = "mismatch_details")]
    mismatch_details: Option<Vec<MismatchDetail>>,
    #[serde(default, alias = "claims_checked")]
    claims_checked: u32,
    #[serde(default, alias = "claims_verified")]
    claims_verified: u32,
    #[serde(default, alias = "claims_rejected")]
    claims_rejected: u32,
    #[serde(default, alias = "fabricated_claims")]
    fabricated_claims: Vec<String>,
}

/// Parse the verifier's answer or fall back to a rejecting verdict.
pub fn parse_verdict(raw: &str) -> Verdict {
    let Some(json) = extract_json_object(raw) else {
        warn!("Verifier response contained no JSON object");
        return unparsable_verdict();
    };

    match serde_json::from_str::<RawVerdict>(json) {
        Ok(parsed) => normalize(parsed),
        Err(e) => {
            warn!(error = %e, "Verifier response did not match the verdict schema");
            unparsable_verdict()
        }
    }
}

pub fn unparsable_verdict() -> Verdict {
    Verdict {
        is_valid: false,
        status: FeedbackStatus::Pending,
        errors: vec![UNPARSABLE_VERDICT_ERROR.to_string()],
        mismatch_details: None,
        claims_checked: 0,
        claims_verified: 0,
        claims_rejected: 0,
        fabricated_claims: Vec::new(),
    }
}

/// Locate the single outermost JSON object, tolerating code fences and prose around it.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn normalize(parsed: RawVerdict) -> Verdict {
    let details = parsed.mismatch_details.filter(|d| !d.is_empty());

    let mut fabricated_claims: Vec<String> = Vec::new();
    for claim in parsed.fabricated_claims {
        let claim = claim.trim();
        if !claim.is_empty() && !fabricated_claims.iter().any(|c| c == claim) {
            fabricated_claims.push(claim.to_string());
        }
    }

    let mut errors: Vec<String> = parsed
        .errors
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect();

    // A verdict that names problems anywhere is not allowed to certify.
    if errors.is_empty() {
        if let Some(details) = &details {
            errors = details.iter().map(describe_mismatch).collect();
        }
    }
    if errors.is_empty() && !fabricated_claims.is_empty() {
        errors = fabricated_claims
            .iter()
            .map(|c| format!("Claim not supported by the source: {}", c))
            .collect();
    }

    // Counts alone are enough to refuse certification.
    let unsupported = parsed
        .claims_rejected
        .max(parsed.claims_checked.saturating_sub(parsed.claims_verified));
    if errors.is_empty() && unsupported > 0 {
        errors.push(format!(
            "Verifier reported {} rejected claim(s) without describing them",
            unsupported
        ));
    }

    let is_valid = parsed.is_valid && errors.is_empty();
    if !is_valid && errors.is_empty() {
        errors.push(REJECTED_WITHOUT_DETAILS.to_string());
    }

    Verdict {
        is_valid,
        status: if is_valid {
            FeedbackStatus::Verified
        } else {
            FeedbackStatus::Rejected
        },
        errors,
        mismatch_details: details,
        claims_checked: parsed.claims_checked,
        claims_verified: parsed.claims_verified,
        claims_rejected: parsed.claims_rejected,
        fabricated_claims,
    }
}

fn describe_mismatch(detail: &MismatchDetail) -> String {
    let explanation = detail.explanation.trim();
    match (detail.claim_in_summary.trim(), explanation) {
        ("", "") => format!("{:?} mismatch", detail.kind),
        ("", explanation) => explanation.to_string(),
        (claim, "") => format!("\"{}\" is not supported by the source", claim),
        (claim, explanation) => format!("\"{}\": {}", claim, explanation),
    }
}

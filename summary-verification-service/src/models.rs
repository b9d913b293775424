use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verification attempts allowed per run before escalating to manual review
pub const MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a document's summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    Pending,
    Verified,
    Rejected,
    ManualReview,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Rejected => "rejected",
            VerificationStatus::ManualReview => "manual_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(VerificationStatus::Pending),
            "verified" => Some(VerificationStatus::Verified),
            "rejected" => Some(VerificationStatus::Rejected),
            "manual_review" => Some(VerificationStatus::ManualReview),
            _ => None,
        }
    }
}

/// Outcome of a single verifier call as recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Verified,
    Rejected,
    /// The verifier answered but its verdict could not be parsed
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    DigitChange,
    NameChange,
    Hallucination,
    ContextOmission,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchDetail {
    #[serde(rename = "type", default)]
    pub kind: MismatchKind,
    #[serde(default, alias = "claim_in_summary")]
    pub claim_in_summary: String,
    #[serde(default, alias = "source_evidence")]
    pub source_evidence: Option<String>,
    #[serde(default)]
    pub explanation: String,
}

/// Normalized verifier result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub is_valid: bool,
    pub status: FeedbackStatus,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatch_details: Option<Vec<MismatchDetail>>,
    pub claims_checked: u32,
    pub claims_verified: u32,
    pub claims_rejected: u32,
    #[serde(default)]
    pub fabricated_claims: Vec<String>,
}

/// One verification attempt's audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub status: FeedbackStatus,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatch_details: Option<Vec<MismatchDetail>>,
    pub claims_checked: u32,
    pub claims_verified: u32,
    pub claims_rejected: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fabricated_claims: Vec<String>,
}

impl FeedbackEntry {
    pub fn from_verdict(attempt: u32, verdict: &Verdict) -> Self {
        Self {
            attempt,
            timestamp: Utc::now(),
            status: verdict.status,
            errors: verdict.errors.clone(),
            mismatch_details: verdict.mismatch_details.clone(),
            claims_checked: verdict.claims_checked,
            claims_verified: verdict.claims_verified,
            claims_rejected: verdict.claims_rejected,
            fabricated_claims: verdict.fabricated_claims.clone(),
        }
    }
}

/// The persisted article record under verification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source_content: String,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub verification_status: VerificationStatus,
    pub attempt_count: u32,
    pub feedback_history: Vec<FeedbackEntry>,
    /// Bumped by storage on every successful update
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly ingested document: no summary, nothing verified yet.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        source_content: impl Into<String>,
        category: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            source_content: source_content.into(),
            category,
            summary: None,
            verification_status: VerificationStatus::Pending,
            attempt_count: 0,
            feedback_history: Vec::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Fields written back after a verification step. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    pub summary: Option<String>,
    pub verification_status: Option<VerificationStatus>,
    pub attempt_count: Option<u32>,
    pub feedback_history: Option<Vec<FeedbackEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySummaryRequest {
    #[serde(default, alias = "document_id")]
    pub document_id: Option<String>,
    #[serde(default, alias = "force_regenerate")]
    pub force_regenerate: bool,
}

/// Result of one invocation of the verification workflow
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
    pub document_id: String,
    pub status: VerificationStatus,
    pub attempts: u32,
    pub summary: Option<String>,
    pub feedback_history: Vec<FeedbackEntry>,
    pub last_verdict: Option<Verdict>,
    /// True when the stored state was returned without running the loop
    pub cached: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewStateResponse {
    pub document_id: String,
    pub title: String,
    pub status: VerificationStatus,
    pub attempts: u32,
    pub summary: Option<String>,
    pub feedback_history: Vec<FeedbackEntry>,
    pub needs_human_review: bool,
}

impl From<Document> for ReviewStateResponse {
    fn from(document: Document) -> Self {
        Self {
            needs_human_review: document.verification_status == VerificationStatus::ManualReview,
            document_id: document.id,
            title: document.title,
            status: document.verification_status,
            attempts: document.attempt_count,
            summary: document.summary,
            feedback_history: document.feedback_history,
        }
    }
}

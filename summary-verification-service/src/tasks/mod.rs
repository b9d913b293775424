pub mod correction;
pub mod finalize;
pub mod summary_generation;
pub mod types;
pub mod utils;
pub mod verification;

pub use correction::CorrectionTask;
pub use finalize::FinalizeTask;
pub use summary_generation::SummaryGenerationTask;
pub use types::{RunState, Step};
pub use utils::SourceText;
pub use verification::{VerificationTask, parse_verdict};

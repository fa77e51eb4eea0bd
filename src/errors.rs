use std::fmt;
use std::time::Duration;

use crate::models::OrderId;
use crate::order::WizardStep;

/// The workflow steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Authenticate,
    Probe,
    Import,
    Order,
    Poll,
    Extract,
    Export,
}

impl Step {
    pub const ALL: [Step; 7] = [
        Step::Authenticate,
        Step::Probe,
        Step::Import,
        Step::Order,
        Step::Poll,
        Step::Extract,
        Step::Export,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Step::Probe => "probe vendor",
            Step::Authenticate => "log in",
            Step::Import => "import contacts",
            Step::Order => "place skip-trace order",
            Step::Poll => "wait for order",
            Step::Extract => "extract contacts",
            Step::Export => "export merged CSV",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Every way a run can stop. Each variant belongs to exactly one [`Step`].
#[derive(Debug)]
pub enum WorkflowError {
    /// The startup capability probe could not reach the vendor.
    Probe(String),
    /// No valid session could be established.
    Authentication(String),
    /// Upload or group creation was not confirmed.
    Import(String),
    /// A wizard step could not be confirmed.
    Order { step: WizardStep, reason: String },
    /// Status could not be confirmed within the polling budget.
    PollTimeout {
        order_id: OrderId,
        attempts: u32,
        elapsed: Duration,
    },
    /// The vendor explicitly reported the order as failed.
    PollFailed { order_id: OrderId, status: String },
    /// No contact data could be obtained from the listing response.
    Extraction(String),
    /// The merged output could not be written.
    Export(String),
    /// The run-wide wall-clock budget ran out before `step` started.
    RunBudgetExceeded { step: Step },
}

impl WorkflowError {
    pub fn step(&self) -> Step {
        match self {
            WorkflowError::Probe(_) => Step::Probe,
            WorkflowError::Authentication(_) => Step::Authenticate,
            WorkflowError::Import(_) => Step::Import,
            WorkflowError::Order { .. } => Step::Order,
            WorkflowError::PollTimeout { .. } | WorkflowError::PollFailed { .. } => Step::Poll,
            WorkflowError::Extraction(_) => Step::Extract,
            WorkflowError::Export(_) => Step::Export,
            WorkflowError::RunBudgetExceeded { step } => *step,
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::Probe(msg) => write!(f, "Vendor probe failed: {}", msg),
            WorkflowError::Authentication(msg) => write!(f, "Authentication failed: {}", msg),
            WorkflowError::Import(msg) => write!(f, "Import failed: {}", msg),
            WorkflowError::Order { step, reason } => {
                write!(f, "Order failed at step '{}': {}", step, reason)
            }
            WorkflowError::PollTimeout {
                order_id,
                attempts,
                elapsed,
            } => write!(
                f,
                "Order {} not confirmed complete after {} attempts ({}s); its status is unknown",
                order_id,
                attempts,
                elapsed.as_secs()
            ),
            WorkflowError::PollFailed { order_id, status } => {
                write!(f, "Order {} reported failure: {}", order_id, status)
            }
            WorkflowError::Extraction(msg) => write!(f, "Extraction failed: {}", msg),
            WorkflowError::Export(msg) => write!(f, "Export failed: {}", msg),
            WorkflowError::RunBudgetExceeded { step } => {
                write!(f, "Run budget exhausted before step '{}'", step)
            }
        }
    }
}

impl std::error::Error for WorkflowError {}

pub type Result<T> = std::result::Result<T, WorkflowError>;

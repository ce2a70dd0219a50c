/// Raised by the public action entry points before any optimistic patch is applied.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IouError {
    #[error("{action} is not permitted: {reason}")]
    NotPermitted {
        action: &'static str,
        reason: &'static str,
    },
    #[error("Report {0} was not found in the store")]
    ReportNotFound(String),
    #[error("Transaction {0} was not found in the store")]
    TransactionNotFound(String),
    #[error("Report action {0} was not found in the store")]
    ActionNotFound(String),
    #[error("Amount {0} is not a valid expense amount")]
    InvalidAmount(i64),
    #[error("No participants were selected for the request")]
    MissingParticipants,
    #[error("The edit does not change any field")]
    NothingToUpdate,
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Key '{0}' does not belong to any known collection")]
    InvalidKey(String),
    #[error("Value stored under '{key}' could not be decoded: {reason}")]
    Codec { key: String, reason: String },
    #[error("Storage backend failure: {0}")]
    Backend(#[from] sled::Error),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be a boolean, got '{value}'")]
    InvalidBool { name: &'static str, value: String },
    #[error("{name} must be a three letter ISO currency code, got '{value}'")]
    InvalidCurrency { name: &'static str, value: String },
}

/// User visible rollback messages, attached to `errors`/`errorFields` maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMessage {
    GenericCreateFailure,
    GenericCreateInvoiceFailure,
    GenericEditFailure,
    GenericDeleteFailure,
    GenericTrackExpenseFailure,
    GenericSplitFailure,
    GenericHoldFailure,
    GenericUnholdFailure,
    ReceiptFailure,
    ReceiptDeleteFailure,
    PaymentFailure,
    ApproveFailure,
    UnapproveFailure,
    SubmitFailure,
    CancelPaymentFailure,
}

impl ErrorMessage {
    pub fn text(self) -> &'static str {
        match self {
            Self::GenericCreateFailure => "Unexpected error submitting this expense. Please try again later.",
            Self::GenericCreateInvoiceFailure => "Unexpected error sending this invoice. Please try again later.",
            Self::GenericEditFailure => "Unexpected error editing this expense. Please try again later.",
            Self::GenericDeleteFailure => "Unexpected error deleting this expense. Please try again later.",
            Self::GenericTrackExpenseFailure => "Unexpected error tracking this expense. Please try again later.",
            Self::GenericSplitFailure => "Unexpected error splitting this expense. Please try again later.",
            Self::GenericHoldFailure => "Unexpected error holding this expense. Please try again later.",
            Self::GenericUnholdFailure => "Unexpected error unholding this expense. Please try again later.",
            Self::ReceiptFailure => "The receipt did not upload.",
            Self::ReceiptDeleteFailure => "Unexpected error deleting this receipt. Please try again later.",
            Self::PaymentFailure => "Unexpected error paying this report. Please try again later.",
            Self::ApproveFailure => "Unexpected error approving this report. Please try again later.",
            Self::UnapproveFailure => "Unexpected error unapproving this report. Please try again later.",
            Self::SubmitFailure => "Unexpected error submitting this report. Please try again later.",
            Self::CancelPaymentFailure => "Unexpected error cancelling this payment. Please try again later.",
        }
    }
}

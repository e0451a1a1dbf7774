use hexforge_protocol::ErrorKind;

/// A business rule that blocked a crafting operation. Nothing was mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleViolation {
    #[error("blueprint {blueprint_id} cannot be crafted at a {node_type} node")]
    WrongNodeType {
        blueprint_id: String,
        node_type: String,
    },
    #[error("node tier {tier} is below the required tier {required}")]
    TierTooLow { tier: u32, required: u32 },
    #[error("blueprint {0} has not been learned")]
    NotLearned(String),
    #[error("a production core must be installed to craft at a {0} node")]
    CoreRequired(String),
    #[error("insufficient {item_id}: need {needed}, have {available}")]
    InsufficientMaterials {
        item_id: String,
        needed: u64,
        available: u64,
    },
    #[error("no {0} in storage to learn from")]
    MissingBlueprintItem(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CraftError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Rule(#[from] RuleViolation),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for CraftError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(e.into())
    }
}

impl CraftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Rule(_) => ErrorKind::Rule,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type CraftResult<T> = Result<T, CraftError>;

use serde::{Deserialize, Serialize};

/// Classification state of a completed call.
///
/// `Unclassified` moves to `Normal` or `Outlier` exactly once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLabel {
    #[default]
    Unclassified,
    Normal,
    Outlier,
}

impl CallLabel {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallLabel::Unclassified)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: CallLabel) -> bool {
        matches!(
            (self, next),
            (CallLabel::Unclassified, CallLabel::Normal)
                | (CallLabel::Unclassified, CallLabel::Outlier)
        )
    }
}

impl std::fmt::Display for CallLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unclassified => write!(f, "unclassified"),
            Self::Normal => write!(f, "normal"),
            Self::Outlier => write!(f, "outlier"),
        }
    }
}

//! Condition trees, compiled predicates, ordering and paging.

mod condition;
mod predicate;

pub use condition::*;
pub use predicate::*;

/// Sort key for filtered reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortOrder {
    pub field: String,
    pub descending: bool,
}

impl SortOrder {
    pub fn ascending(field: impl Into<String>) -> Self {
        SortOrder {
            field: field.into(),
            descending: false,
        }
    }

    /// Parse `field` / `-field`.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('-') {
            Some(field) => SortOrder {
                field: field.to_string(),
                descending: true,
            },
            None => Self::ascending(raw),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

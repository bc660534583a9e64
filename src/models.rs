//! Row types and core constants shared across the transform pipeline.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::FromRow;

/// Dimension of every stored embedding vector.
pub const EMBEDDING_DIM: usize = 768;

/// Privacy classification of an email, ordered from most to least restricted.
///
/// Stored as its integer code in `emails.privacy_tier`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrivacyTier {
    Sensitive = 1,
    Personal = 2,
    Public = 3,
}

impl PrivacyTier {
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(PrivacyTier::Sensitive),
            2 => Some(PrivacyTier::Personal),
            3 => Some(PrivacyTier::Public),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PrivacyTier::Sensitive => "SENSITIVE",
            PrivacyTier::Personal => "PERSONAL",
            PrivacyTier::Public => "PUBLIC",
        }
    }
}

/// The subset of an `emails` row the transform pipeline reads.
///
/// Derived columns are write-only from the pipeline's point of view; raw
/// `body_text` is never mutated.
#[derive(Debug, Clone, FromRow)]
pub struct EmailRow {
    pub id: i64,
    pub account_id: i32,
    pub subject: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub snippet: Option<String>,
    pub labels: Option<Vec<String>>,
    pub has_attachments: bool,
    pub body_text: Option<String>,
}

/// A chunk row to be written for a long email body.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub text: String,
    pub position: i32,
    pub weight: f64,
    pub embedding: Vector,
}

/// The full derived state written for one email in a single transaction.
#[derive(Debug, Clone)]
pub struct DerivedRecord {
    pub email_id: i64,
    pub privacy_tier: PrivacyTier,
    pub body_redacted: Option<String>,
    pub snippet_redacted: Option<String>,
    pub subject_embedding: Option<Vector>,
    pub body_embedding: Option<Vector>,
    pub body_pooled_embedding: Option<Vector>,
    pub transform_completed_at: DateTime<Utc>,
    pub chunks: Vec<ChunkRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_codes_round_trip() {
        for tier in [
            PrivacyTier::Sensitive,
            PrivacyTier::Personal,
            PrivacyTier::Public,
        ] {
            assert_eq!(PrivacyTier::from_code(tier.code()), Some(tier));
        }
        assert_eq!(PrivacyTier::from_code(0), None);
        assert_eq!(PrivacyTier::from_code(4), None);
    }

    #[test]
    fn tier_names() {
        assert_eq!(PrivacyTier::Sensitive.name(), "SENSITIVE");
        assert_eq!(PrivacyTier::Personal.name(), "PERSONAL");
        assert_eq!(PrivacyTier::Public.name(), "PUBLIC");
    }
}

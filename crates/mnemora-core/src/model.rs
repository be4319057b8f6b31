//! Core data model: Memory, Vector, Association, Group, CacheEntry, Session.
//!
//! Mirrors the entities and invariants of the data model: ids are opaque
//! strings, timestamps are RFC3339, `metadata` is an opaque JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum and maximum allowed `Memory::weight`.
pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 10.0;

pub fn clamp_weight(w: f64) -> f64 {
    w.clamp(MIN_WEIGHT, MAX_WEIGHT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    UserInput,
    AssistantReply,
    Summary,
    System,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::UserInput => "user_input",
            MemoryKind::AssistantReply => "assistant_reply",
            MemoryKind::Summary => "summary",
            MemoryKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user_input" => Some(MemoryKind::UserInput),
            "assistant_reply" => Some(MemoryKind::AssistantReply),
            "summary" => Some(MemoryKind::Summary),
            "system" => Some(MemoryKind::System),
            _ => None,
        }
    }

    /// The role that is consistent with this kind.
    pub fn expected_role(&self) -> Role {
        match self {
            MemoryKind::UserInput => Role::User,
            MemoryKind::AssistantReply => Role::Assistant,
            MemoryKind::Summary | MemoryKind::System => Role::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A stored conversational memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub kind: MemoryKind,
    pub role: Role,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub weight: f64,
    pub group_id: Option<String>,
    pub summary: Option<String>,
    pub last_accessed: DateTime<Utc>,
    pub archived: bool,
    pub metadata: serde_json::Value,
}

impl Memory {
    pub fn new(content: String, kind: MemoryKind, role: Role, session_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            kind,
            role,
            session_id,
            created_at: now,
            weight: 5.0,
            group_id: None,
            summary: None,
            last_accessed: now,
            archived: false,
            metadata: serde_json::json!({}),
        }
    }

    /// Read-only tier classification of this memory's weight.
    pub fn tier(&self) -> MemoryTier {
        MemoryTier::classify(self.weight)
    }
}

/// A partial update applied to a Memory via `update_memory`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryPatch {
    pub weight: Option<f64>,
    pub group_id: Option<Option<String>>,
    pub summary: Option<Option<String>>,
    pub metadata: Option<serde_json::Value>,
    pub archived: Option<bool>,
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Core,
    Archive,
    LongTerm,
    ShortTerm,
}

impl MemoryTier {
    pub fn classify(weight: f64) -> Self {
        if weight >= 9.0 {
            MemoryTier::Core
        } else if weight >= 7.0 {
            MemoryTier::Archive
        } else if weight >= 4.0 {
            MemoryTier::LongTerm
        } else {
            MemoryTier::ShortTerm
        }
    }
}

/// A unit-norm embedding tied one-to-one with a Memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vector {
    pub id: String,
    pub memory_id: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    TemporalSequence,
    SameTopic,
    CauseEffect,
    Contradiction,
    IsRelatedTo,
    Summarizes,
}

impl AssociationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssociationKind::TemporalSequence => "temporal_sequence",
            AssociationKind::SameTopic => "same_topic",
            AssociationKind::CauseEffect => "cause_effect",
            AssociationKind::Contradiction => "contradiction",
            AssociationKind::IsRelatedTo => "is_related_to",
            AssociationKind::Summarizes => "summarizes",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temporal_sequence" => Some(AssociationKind::TemporalSequence),
            "same_topic" => Some(AssociationKind::SameTopic),
            "cause_effect" => Some(AssociationKind::CauseEffect),
            "contradiction" => Some(AssociationKind::Contradiction),
            "is_related_to" => Some(AssociationKind::IsRelatedTo),
            "summarizes" => Some(AssociationKind::Summarizes),
            _ => None,
        }
    }
}

/// A typed, weighted, symmetric relationship between two memories. Only one
/// direction is modeled in memory/application code; Storage persists both
/// `(a,b)` and `(b,a)` rows to satisfy the symmetry invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Association {
    pub source_id: String,
    pub target_id: String,
    pub kind: AssociationKind,
    pub strength: f32,
    pub created_at: DateTime<Utc>,
    pub last_activated_at: DateTime<Utc>,
}

pub const SUPER_GROUPS: &[&str] = &[
    "work",
    "life",
    "study",
    "entertainment",
    "health",
    "social",
    "other",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub super_group: String,
    pub topic: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub summary: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    Hot,
    Warm,
    Cold,
}

impl CacheLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheLevel::Hot => "hot",
            CacheLevel::Warm => "warm",
            CacheLevel::Cold => "cold",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub memory_id: String,
    pub level: CacheLevel,
    pub priority: f64,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        assert_eq!(MemoryTier::classify(9.5), MemoryTier::Core);
        assert_eq!(MemoryTier::classify(9.0), MemoryTier::Core);
        assert_eq!(MemoryTier::classify(8.999), MemoryTier::Archive);
        assert_eq!(MemoryTier::classify(7.0), MemoryTier::Archive);
        assert_eq!(MemoryTier::classify(6.999), MemoryTier::LongTerm);
        assert_eq!(MemoryTier::classify(4.0), MemoryTier::LongTerm);
        assert_eq!(MemoryTier::classify(3.999), MemoryTier::ShortTerm);
        assert_eq!(MemoryTier::classify(0.1), MemoryTier::ShortTerm);
    }

    #[test]
    fn weight_clamped_to_range() {
        assert_eq!(clamp_weight(100.0), MAX_WEIGHT);
        assert_eq!(clamp_weight(-5.0), MIN_WEIGHT);
        assert_eq!(clamp_weight(5.0), 5.0);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            MemoryKind::UserInput,
            MemoryKind::AssistantReply,
            MemoryKind::Summary,
            MemoryKind::System,
        ] {
            assert_eq!(MemoryKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn association_kind_round_trips_through_str() {
        for kind in [
            AssociationKind::TemporalSequence,
            AssociationKind::SameTopic,
            AssociationKind::CauseEffect,
            AssociationKind::Contradiction,
            AssociationKind::IsRelatedTo,
            AssociationKind::Summarizes,
        ] {
            assert_eq!(AssociationKind::parse(kind.as_str()), Some(kind));
        }
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field name to value mapping sent to the remote as-is.
pub type Payload = Map<String, Value>;

#[derive(Debug, Error)]
#[error("unknown mutation kind: {0}")]
pub struct UnknownKind(pub String);

/// Record type carried by a queued mutation. Decides the remote route and
/// which payload field identifies the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Occasion,
    Games,
    #[serde(rename = "pulltabs")]
    PullTabs,
    #[serde(rename = "moneycount")]
    MoneyCount,
    Photo,
}

impl MutationKind {
    pub const ALL: [MutationKind; 5] = [
        MutationKind::Occasion,
        MutationKind::Games,
        MutationKind::PullTabs,
        MutationKind::MoneyCount,
        MutationKind::Photo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Occasion => "occasion",
            MutationKind::Games => "games",
            MutationKind::PullTabs => "pulltabs",
            MutationKind::MoneyCount => "moneycount",
            MutationKind::Photo => "photo",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownKind> {
        match value.trim().to_ascii_lowercase().as_str() {
            "occasion" => Ok(MutationKind::Occasion),
            "games" => Ok(MutationKind::Games),
            "pulltabs" => Ok(MutationKind::PullTabs),
            "moneycount" => Ok(MutationKind::MoneyCount),
            "photo" => Ok(MutationKind::Photo),
            other => Err(UnknownKind(other.to_string())),
        }
    }

    /// Value of the `path` query parameter the remote dispatches on.
    pub fn route(&self) -> &'static str {
        self.as_str()
    }

    // Game sheets, pull-tab usage and money counts are saved whole per
    // occasion; photos are individual records.
    fn key_fields(&self) -> &'static [&'static str] {
        match self {
            MutationKind::Occasion => &["id", "occasionId"],
            MutationKind::Games | MutationKind::PullTabs | MutationKind::MoneyCount => {
                &["occasionId"]
            }
            MutationKind::Photo => &["id"],
        }
    }

    /// Identity of the record a payload describes, if it carries one.
    pub fn domain_key(&self, payload: &Payload) -> Option<String> {
        self.key_fields()
            .iter()
            .find_map(|field| match payload.get(*field)? {
                Value::String(value) if !value.trim().is_empty() => {
                    Some(value.trim().to_string())
                }
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

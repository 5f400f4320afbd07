use serde::{Deserialize, Serialize};

/// A projection as it is persisted. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: String,
    pub player: String,
    pub team: String,
    pub position: String,
    pub league: String,
    pub stat: String,
    pub line: f64,
    pub start_time: String,
    pub status: String,
    pub game_id: Option<String>,
}

/// Secondary key for league/stat/player lookup and autocomplete.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompositeIndexEntry {
    pub league: String,
    pub stat: String,
    pub player_name: String,
}

impl CompositeIndexEntry {
    pub fn new(league: &str, stat: &str, player_name: &str) -> Self {
        Self {
            league: league.to_string(),
            stat: stat.to_string(),
            player_name: player_name.to_string(),
        }
    }

    pub fn from_record(record: &CanonicalRecord) -> Self {
        Self::new(&record.league, &record.stat, &record.player)
    }
}

// Wire shapes. Everything is optional here; the mapper decides what is required.

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    pub fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLine {
    Number(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
pub struct RawProjection {
    pub id: Option<RawId>,
    pub attributes: Option<RawProjectionAttributes>,
    pub relationships: Option<RawRelationships>,
}

#[derive(Debug, Deserialize)]
pub struct RawProjectionAttributes {
    pub stat_type: Option<String>,
    pub line_score: Option<RawLine>,
    pub start_time: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawRelationships {
    #[serde(alias = "player")]
    pub new_player: Option<RawRelationship>,
    pub league: Option<RawRelationship>,
    pub game: Option<RawRelationship>,
}

#[derive(Debug, Deserialize)]
pub struct RawRelationship {
    pub data: Option<RawRef>,
}

#[derive(Debug, Deserialize)]
pub struct RawRef {
    pub id: RawId,
}

/// One entry of the `included` side table.
#[derive(Debug, Deserialize)]
pub struct RawEntity {
    pub id: Option<RawId>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub attributes: Option<RawEntityAttributes>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawEntityAttributes {
    pub name: Option<String>,
    pub team: Option<String>,
    pub position: Option<String>,
}

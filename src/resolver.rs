use crate::config::UNKNOWN;
use crate::error::StructuralError;
use crate::extract::Elements;
use crate::models::RawEntity;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub name: String,
    pub team: String,
    pub position: String,
}

impl PlayerInfo {
    fn unknown() -> Self {
        Self {
            name: UNKNOWN.to_string(),
            team: UNKNOWN.to_string(),
            position: UNKNOWN.to_string(),
        }
    }
}

/// Side-table lookups. Every lookup is total: unknown ids resolve to the
/// `Unknown` sentinel.
pub struct ReferenceMaps {
    players: FxHashMap<String, PlayerInfo>,
    leagues: FxHashMap<String, String>,
    unknown_player: PlayerInfo,
}

impl Default for ReferenceMaps {
    fn default() -> Self {
        Self::empty()
    }
}

impl ReferenceMaps {
    pub fn empty() -> Self {
        Self {
            players: FxHashMap::default(),
            leagues: FxHashMap::default(),
            unknown_player: PlayerInfo::unknown(),
        }
    }

    /// Parses the whole side table. It is small compared to the data array,
    /// so each entity is fully decoded.
    pub fn from_side_table(raw: &str, included: Option<usize>) -> Result<Self, StructuralError> {
        let mut maps = Self::empty();
        let Some(start) = included else {
            debug!("No side table present");
            return Ok(maps);
        };

        let mut skipped = 0u64;
        for element in Elements::new(raw, start)? {
            let element = element?;
            match serde_json::from_str::<RawEntity>(element.text) {
                Ok(entity) => maps.insert(entity),
                Err(e) => {
                    skipped += 1;
                    warn!(offset = element.start, error = %e, "Skipping malformed side-table entry");
                }
            }
        }

        info!(
            players = maps.players.len(),
            leagues = maps.leagues.len(),
            skipped,
            "Side table resolved"
        );
        Ok(maps)
    }

    fn insert(&mut self, entity: RawEntity) {
        let Some(id) = entity.id.map(|id| id.into_string()) else {
            return;
        };
        let attrs = entity.attributes.unwrap_or_default();
        let or_unknown = |v: Option<String>| v.unwrap_or_else(|| UNKNOWN.to_string());

        match entity.kind.as_deref() {
            Some("new_player") | Some("player") => {
                self.players.insert(
                    id,
                    PlayerInfo {
                        name: or_unknown(attrs.name),
                        team: or_unknown(attrs.team),
                        position: or_unknown(attrs.position),
                    },
                );
            }
            Some("league") => {
                self.leagues.insert(id, or_unknown(attrs.name));
            }
            _ => {}
        }
    }

    pub fn player(&self, id: &str) -> &PlayerInfo {
        self.players.get(id).unwrap_or(&self.unknown_player)
    }

    pub fn league(&self, id: &str) -> &str {
        self.leagues.get(id).map(String::as_str).unwrap_or(UNKNOWN)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn league_count(&self) -> usize {
        self.leagues.len()
    }
}

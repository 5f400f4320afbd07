use crate::config::ACCEPTED_STATUS;
use crate::error::RecordError;
use crate::models::{CanonicalRecord, RawLine, RawProjection, RawRelationship};
use crate::resolver::ReferenceMaps;

#[derive(Debug, Clone, PartialEq)]
pub enum Mapped {
    Record(CanonicalRecord),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Well-formed, but not a pre-game projection.
    Status(String),
    Malformed(RecordError),
}

/// Maps one raw data element. Total: every failure becomes a `Skip`.
pub fn map_element(text: &str, refs: &ReferenceMaps) -> Mapped {
    let raw = match serde_json::from_str::<RawProjection>(text) {
        Ok(raw) => raw,
        Err(e) => return Mapped::Skip(SkipReason::Malformed(RecordError::Decode(e.to_string()))),
    };
    match map_projection(raw, refs) {
        Ok(mapped) => mapped,
        Err(e) => Mapped::Skip(SkipReason::Malformed(e)),
    }
}

pub fn map_projection(raw: RawProjection, refs: &ReferenceMaps) -> Result<Mapped, RecordError> {
    let id = raw.id.ok_or(RecordError::MissingField("id"))?.into_string();
    let attrs = raw.attributes.ok_or(RecordError::MissingField("attributes"))?;
    let rels = raw
        .relationships
        .ok_or(RecordError::MissingField("relationships"))?;

    let status = attrs.status.ok_or(RecordError::MissingField("status"))?;
    let stat = attrs.stat_type.ok_or(RecordError::MissingField("stat_type"))?;
    let start_time = attrs
        .start_time
        .ok_or(RecordError::MissingField("start_time"))?;
    let line = match attrs.line_score.ok_or(RecordError::MissingField("line_score"))? {
        RawLine::Number(n) if n.is_finite() => n,
        RawLine::Number(n) => return Err(RecordError::InvalidLine(n.to_string())),
        RawLine::Text(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or(RecordError::InvalidLine(s))?,
    };

    let player_id = reference_id(rels.new_player).ok_or(RecordError::MissingField("new_player"))?;
    let league_id = reference_id(rels.league).ok_or(RecordError::MissingField("league"))?;
    let game_id = reference_id(rels.game);

    if status != ACCEPTED_STATUS {
        return Ok(Mapped::Skip(SkipReason::Status(status)));
    }

    let player = refs.player(&player_id);
    Ok(Mapped::Record(CanonicalRecord {
        id,
        player: player.name.clone(),
        team: player.team.clone(),
        position: player.position.clone(),
        league: refs.league(&league_id).to_string(),
        stat,
        line,
        start_time,
        status,
        game_id,
    }))
}

fn reference_id(rel: Option<RawRelationship>) -> Option<String> {
    rel.and_then(|r| r.data).map(|d| d.id.into_string())
}

//! JSON payload decoding for remote fetch responses.

use serde::Deserialize;

use seqflow_core::error::TaskError;

use super::model::{AnnotationGroups, FetchedSequence};

#[derive(Debug, Deserialize)]
struct SequencePayload {
    id: String,
    residues: String,
}

pub fn parse_sequence(data: &[u8], accession: &str) -> Result<FetchedSequence, TaskError> {
    let payload: SequencePayload = serde_json::from_slice(data)
        .map_err(|e| TaskError::Protocol(format!("malformed sequence payload: {e}")))?;
    if payload.residues.is_empty() {
        return Err(TaskError::Protocol(format!(
            "sequence with ID={accession} is not found"
        )));
    }
    Ok(FetchedSequence {
        id: payload.id,
        residues: payload.residues,
    })
}

pub fn parse_features(data: &[u8]) -> Result<AnnotationGroups, TaskError> {
    serde_json::from_slice(data)
        .map_err(|e| TaskError::Protocol(format!("malformed features payload: {e}")))
}

#[derive(Debug, Deserialize)]
struct ConvertCandidate {
    accession: String,
    #[serde(default)]
    identical: bool,
}

#[derive(Debug, Deserialize)]
struct ConvertPayload {
    #[serde(default)]
    candidates: Vec<ConvertCandidate>,
}

/// Pick the best converted accession: an identical match wins, otherwise the
/// first candidate. Version suffixes ("P12345.2", "P12345-1") are stripped.
pub fn parse_convert(data: &[u8]) -> Result<Option<String>, TaskError> {
    let payload: ConvertPayload = serde_json::from_slice(data)
        .map_err(|e| TaskError::Protocol(format!("malformed conversion payload: {e}")))?;

    let best = payload
        .candidates
        .iter()
        .find(|c| c.identical)
        .or_else(|| payload.candidates.first());

    Ok(best.map(|c| strip_version(&c.accession)))
}

fn strip_version(accession: &str) -> String {
    accession
        .split(['.', '-'])
        .next()
        .unwrap_or(accession)
        .to_string()
}

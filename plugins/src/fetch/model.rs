use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strand {
    #[default]
    Direct,
    Complementary,
}

/// One feature annotation. Structural equality (`PartialEq`) is the dedup
/// rule used when merging groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    /// 0-based start and inclusive stop; `None` for non-positional features.
    #[serde(default)]
    pub region: Option<(i64, i64)>,
    #[serde(default)]
    pub strand: Strand,
    #[serde(default)]
    pub qualifiers: Vec<(String, String)>,
}

/// Annotations grouped by a semantic key (the feature type).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationGroups(pub BTreeMap<String, Vec<Annotation>>);

impl AnnotationGroups {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn annotation_count(&self) -> usize {
        self.0.values().map(|v| v.len()).sum()
    }

    /// Merge incoming groups. An annotation is appended to an existing group
    /// only if no structurally-equal annotation is already present; unseen
    /// groups are inserted wholesale.
    pub fn merge(&mut self, incoming: AnnotationGroups) {
        for (group, annotations) in incoming.0 {
            match self.0.get_mut(&group) {
                Some(current) => {
                    for annotation in annotations {
                        if !current.contains(&annotation) {
                            current.push(annotation);
                        }
                    }
                }
                None => {
                    self.0.insert(group, annotations);
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedSequence {
    pub id: String,
    pub residues: String,
}

/// The merged result of a composite fetch, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub accession: String,
    pub sequence: FetchedSequence,
    pub annotations: AnnotationGroups,
}

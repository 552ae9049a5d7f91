//! Bibliographic metadata attached to repository records.
//!
//! Mirrors the InvenioRDM metadata block closely enough to round-trip it:
//! fields we never touch are kept in `extra` and written back verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Relation id used for tree structure (parent -> child).
pub const HAS_PART: &str = "haspart";
/// Relation id used for tree structure (child -> parent).
pub const IS_PART_OF: &str = "ispartof";
/// Relation id on the preservation record pointing at the main record.
pub const DESCRIBES: &str = "describes";
/// Relation id on the main record pointing at the preservation record.
pub const IS_DESCRIBED_BY: &str = "isdescribedby";

/// Alternate identifier scheme filled in by the DOI registrar.
pub const DOI_SCHEME: &str = "doi";
/// Marker in a DOI identifier asking for a DOI to be minted on deposit.
pub const DOI_PLACEHOLDER: &str = "NOTYET";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Metadata {
    pub resource_type: ResourceType,

    #[serde(default)]
    pub creators: Vec<Creator>,

    pub title: String,

    /// Extended date-time format, e.g. `2024` or `2024-05-17`.
    pub publication_date: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_identifiers: Vec<RelatedIdentifier>,

    /// Alternate identifiers of the record itself (DOIs, handles).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<AlternateIdentifier>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceType {
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Creator {
    pub person_or_org: PersonOrOrg,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PersonOrOrg {
    /// `personal` or `organizational`.
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RelatedIdentifier {
    pub identifier: String,
    pub scheme: String,
    pub relation_type: RelationType,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AlternateIdentifier {
    pub identifier: String,
    pub scheme: String,
}

impl AlternateIdentifier {
    pub fn is_doi_placeholder(&self) -> bool {
        self.scheme.eq_ignore_ascii_case(DOI_SCHEME) && self.identifier.contains(DOI_PLACEHOLDER)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RelationType {
    pub id: String,

    /// Localized labels keyed by language code.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub title: BTreeMap<String, String>,
}

impl Creator {
    pub fn organization(name: impl Into<String>) -> Self {
        Self {
            person_or_org: PersonOrOrg {
                kind: "organizational".into(),
                name: Some(name.into()),
                given_name: None,
                family_name: None,
            },
            extra: Map::new(),
        }
    }
}

impl RelatedIdentifier {
    /// Build a URL-scheme relation to another record.
    pub fn url(identifier: impl Into<String>, relation: &str) -> Self {
        let label = match relation {
            HAS_PART => "Has part",
            IS_PART_OF => "Is part of",
            DESCRIBES => "Describes",
            IS_DESCRIBED_BY => "Is described by",
            other => other,
        };
        Self {
            identifier: identifier.into(),
            scheme: "url".into(),
            relation_type: RelationType {
                id: relation.to_string(),
                title: BTreeMap::from([("en".to_string(), label.to_string())]),
            },
        }
    }

    pub fn is_relation(&self, relation: &str) -> bool {
        self.relation_type.id.eq_ignore_ascii_case(relation)
    }
}

impl Metadata {
    /// Minimal metadata block, used for synthesized records.
    pub fn new(
        resource_type: &str,
        creators: Vec<Creator>,
        title: impl Into<String>,
        publication_date: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: ResourceType {
                id: resource_type.to_string(),
            },
            creators,
            title: title.into(),
            publication_date: publication_date.into(),
            description: None,
            related_identifiers: Vec::new(),
            identifiers: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn add_related(&mut self, related: RelatedIdentifier) {
        self.related_identifiers.push(related);
    }

    /// Identifiers of all relations of the given type.
    pub fn related_of<'a>(&'a self, relation: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.related_identifiers
            .iter()
            .filter(move |r| r.is_relation(relation))
            .map(|r| r.identifier.as_str())
    }

    pub fn wants_doi(&self) -> bool {
        self.identifiers.iter().any(AlternateIdentifier::is_doi_placeholder)
    }

    /// Replace every DOI placeholder with `doi`. Returns how many were replaced.
    pub fn fill_doi(&mut self, doi: &str) -> usize {
        let mut filled = 0;
        for identifier in self.identifiers.iter_mut().filter(|i| i.is_doi_placeholder()) {
            identifier.identifier = doi.to_string();
            filled += 1;
        }
        filled
    }

    /// Drop DOI placeholders that will not be filled.
    pub fn drop_doi_placeholders(&mut self) -> usize {
        let before = self.identifiers.len();
        self.identifiers.retain(|i| !i.is_doi_placeholder());
        before - self.identifiers.len()
    }
}

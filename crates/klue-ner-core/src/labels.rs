//! # KLUE NER Label Vocabulary
//!
//! The 13-class BIO tag set used by the KLUE NER dataset: six entity types,
//! each with a Begin/Inside pair, plus Outside. Integer ids follow the
//! dataset's own ordering so `ner_tags` can be used as-is.

use std::fmt;
use std::str::FromStr;

use crate::error::NerError;

/// Label id for non-entity units.
pub const OUTSIDE_ID: i64 = 12;

/// Label id excluded from the loss (special tokens, padding).
pub const IGNORE_INDEX: i64 = -100;

/// BIO tags for Korean named entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NerLabel {
    // Date entity
    BeginDate,
    InsideDate,
    // Location entity
    BeginLocation,
    InsideLocation,
    // Organization entity
    BeginOrganization,
    InsideOrganization,
    // Person entity
    BeginPerson,
    InsidePerson,
    // Quantity entity
    BeginQuantity,
    InsideQuantity,
    // Time entity
    BeginTime,
    InsideTime,
    // Outside (non-entity unit)
    Outside,
}

impl NerLabel {
    /// Total number of distinct labels.
    pub const NUM_LABELS: usize = 13;

    /// All labels in id order.
    pub fn all_labels() -> &'static [NerLabel] {
        &[
            NerLabel::BeginDate,
            NerLabel::InsideDate,
            NerLabel::BeginLocation,
            NerLabel::InsideLocation,
            NerLabel::BeginOrganization,
            NerLabel::InsideOrganization,
            NerLabel::BeginPerson,
            NerLabel::InsidePerson,
            NerLabel::BeginQuantity,
            NerLabel::InsideQuantity,
            NerLabel::BeginTime,
            NerLabel::InsideTime,
            NerLabel::Outside,
        ]
    }

    /// Label id as stored in `ner_tags`.
    pub fn id(&self) -> i64 {
        match self {
            NerLabel::BeginDate => 0,
            NerLabel::InsideDate => 1,
            NerLabel::BeginLocation => 2,
            NerLabel::InsideLocation => 3,
            NerLabel::BeginOrganization => 4,
            NerLabel::InsideOrganization => 5,
            NerLabel::BeginPerson => 6,
            NerLabel::InsidePerson => 7,
            NerLabel::BeginQuantity => 8,
            NerLabel::InsideQuantity => 9,
            NerLabel::BeginTime => 10,
            NerLabel::InsideTime => 11,
            NerLabel::Outside => 12,
        }
    }

    /// Get label from id. Returns `None` for the ignore sentinel and
    /// anything outside the vocabulary.
    pub fn from_id(id: i64) -> Option<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| Self::all_labels().get(idx).copied())
    }

    /// Build a label from an entity type and a BIO position.
    pub fn new(entity: EntityType, begin: bool) -> Self {
        match (entity, begin) {
            (EntityType::Date, true) => NerLabel::BeginDate,
            (EntityType::Date, false) => NerLabel::InsideDate,
            (EntityType::Location, true) => NerLabel::BeginLocation,
            (EntityType::Location, false) => NerLabel::InsideLocation,
            (EntityType::Organization, true) => NerLabel::BeginOrganization,
            (EntityType::Organization, false) => NerLabel::InsideOrganization,
            (EntityType::Person, true) => NerLabel::BeginPerson,
            (EntityType::Person, false) => NerLabel::InsidePerson,
            (EntityType::Quantity, true) => NerLabel::BeginQuantity,
            (EntityType::Quantity, false) => NerLabel::InsideQuantity,
            (EntityType::Time, true) => NerLabel::BeginTime,
            (EntityType::Time, false) => NerLabel::InsideTime,
        }
    }

    /// Tag name as used in the KLUE release, e.g. `B-PS`.
    pub fn as_str(&self) -> &'static str {
        match self {
            NerLabel::BeginDate => "B-DT",
            NerLabel::InsideDate => "I-DT",
            NerLabel::BeginLocation => "B-LC",
            NerLabel::InsideLocation => "I-LC",
            NerLabel::BeginOrganization => "B-OG",
            NerLabel::InsideOrganization => "I-OG",
            NerLabel::BeginPerson => "B-PS",
            NerLabel::InsidePerson => "I-PS",
            NerLabel::BeginQuantity => "B-QT",
            NerLabel::InsideQuantity => "I-QT",
            NerLabel::BeginTime => "B-TI",
            NerLabel::InsideTime => "I-TI",
            NerLabel::Outside => "O",
        }
    }

    /// Check if this is a "Begin" tag.
    pub fn is_begin(&self) -> bool {
        matches!(
            self,
            NerLabel::BeginDate
                | NerLabel::BeginLocation
                | NerLabel::BeginOrganization
                | NerLabel::BeginPerson
                | NerLabel::BeginQuantity
                | NerLabel::BeginTime
        )
    }

    /// Check if this is an "Inside" tag.
    pub fn is_inside(&self) -> bool {
        !self.is_begin() && *self != NerLabel::Outside
    }

    /// Get the entity type for this label.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            NerLabel::BeginDate | NerLabel::InsideDate => Some(EntityType::Date),
            NerLabel::BeginLocation | NerLabel::InsideLocation => Some(EntityType::Location),
            NerLabel::BeginOrganization | NerLabel::InsideOrganization => {
                Some(EntityType::Organization)
            }
            NerLabel::BeginPerson | NerLabel::InsidePerson => Some(EntityType::Person),
            NerLabel::BeginQuantity | NerLabel::InsideQuantity => Some(EntityType::Quantity),
            NerLabel::BeginTime | NerLabel::InsideTime => Some(EntityType::Time),
            NerLabel::Outside => None,
        }
    }
}

/// True for ids that name an entity (anything but `O` and the sentinel).
pub fn is_entity_id(id: i64) -> bool {
    NerLabel::from_id(id).is_some_and(|label| label != NerLabel::Outside)
}

impl fmt::Display for NerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NerLabel {
    type Err = NerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "O" {
            return Ok(NerLabel::Outside);
        }
        let (prefix, entity) = s
            .split_once('-')
            .ok_or_else(|| NerError::UnknownLabel(s.to_string()))?;
        let entity: EntityType = entity.parse()?;
        match prefix {
            "B" => Ok(NerLabel::new(entity, true)),
            "I" => Ok(NerLabel::new(entity, false)),
            _ => Err(NerError::UnknownLabel(s.to_string())),
        }
    }
}

/// Entity categories annotated in KLUE NER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Date,
    Location,
    Organization,
    Person,
    Quantity,
    Time,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            EntityType::Date => "DT",
            EntityType::Location => "LC",
            EntityType::Organization => "OG",
            EntityType::Person => "PS",
            EntityType::Quantity => "QT",
            EntityType::Time => "TI",
        };
        f.write_str(code)
    }
}

impl FromStr for EntityType {
    type Err = NerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DT" => Ok(EntityType::Date),
            "LC" => Ok(EntityType::Location),
            "OG" => Ok(EntityType::Organization),
            "PS" => Ok(EntityType::Person),
            "QT" => Ok(EntityType::Quantity),
            "TI" => Ok(EntityType::Time),
            _ => Err(NerError::UnknownLabel(s.to_string())),
        }
    }
}

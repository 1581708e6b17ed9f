//! Typed identifiers for records and sessions.
//!
//! Both wrap a UUIDv7, so ids sort by creation time. `Display` prints the
//! full UUID; `Debug` prints the type name and the 8-char short form. The
//! short form is the tail of the UUID: the head is timestamp and repeats
//! across every id minted in the same minute.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a card or content record.
///
/// Cards and content share one id space: a `root_id` is the card's `RecordId`.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(uuid::Uuid);

/// Identity of one card session activation.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

macro_rules! typed_uuid {
    ($T:ident) => {
        impl $T {
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// Accepts hyphenated or bare 32-char hex.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// Last 8 hex characters (random bits).
            pub fn short(&self) -> String {
                let hex = self.hex();
                hex[hex.len() - 8..].to_string()
            }

            fn hex(&self) -> String {
                self.0.simple().to_string()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($T), "({})"), self.short())
            }
        }
    };
}

typed_uuid!(RecordId);
typed_uuid!(SessionId);

/// Why a card query did not pick exactly one record.
#[derive(Debug, thiserror::Error)]
pub enum PrefixError {
    #[error("no card matches '{0}'")]
    NoMatch(String),
    #[error("'{query}' is ambiguous between {candidates:?}")]
    Ambiguous {
        query: String,
        candidates: Vec<String>,
    },
}

/// Pick one record from `(id, title)` pairs by a human query.
///
/// An exact title wins outright. Failing that, the query must be a prefix of
/// exactly one title, or else match exactly one id's hex form by prefix or
/// by suffix, so a [`RecordId::short`] label works as a query. Hyphens in
/// the query are ignored.
pub fn resolve_record_prefix<'a>(
    records: impl Iterator<Item = (RecordId, Option<&'a str>)>,
    query: &str,
) -> Result<RecordId, PrefixError> {
    let records: Vec<_> = records.collect();

    if let Some((id, _)) = records.iter().find(|(_, title)| *title == Some(query)) {
        return Ok(*id);
    }

    let by_title: Vec<_> = records
        .iter()
        .filter_map(|(id, title)| title.filter(|t| t.starts_with(query)).map(|t| (*id, t)))
        .collect();
    if !by_title.is_empty() {
        return unique(query, by_title);
    }

    let needle = query.replace('-', "").to_ascii_lowercase();
    let by_id: Vec<_> = records
        .iter()
        .filter(|(id, _)| {
            let hex = id.hex();
            !needle.is_empty() && (hex.starts_with(&needle) || hex.ends_with(&needle))
        })
        .map(|(id, _)| (*id, id.short()))
        .collect();
    unique(query, by_id)
}

fn unique<L: ToString>(query: &str, matches: Vec<(RecordId, L)>) -> Result<RecordId, PrefixError> {
    match matches.as_slice() {
        [] => Err(PrefixError::NoMatch(query.to_string())),
        [(id, _)] => Ok(*id),
        _ => Err(PrefixError::Ambiguous {
            query: query.to_string(),
            candidates: matches.iter().map(|(_, label)| label.to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(RecordId::new(), RecordId::new());
    }

    #[test]
    fn test_parse_round_trips_display() {
        let id = RecordId::new();
        assert_eq!(RecordId::parse(&id.to_string()).unwrap(), id);
        assert!(RecordId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_debug_is_short() {
        let id = SessionId::new();
        assert_eq!(format!("{id:?}"), format!("SessionId({})", id.short()));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_serializes_as_plain_uuid_string() {
        let id = RecordId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        assert_eq!(serde_json::from_str::<RecordId>(&json).unwrap(), id);
    }

    #[test]
    fn test_exact_title_beats_longer_title() {
        let weekly = RecordId::new();
        let entries = vec![(weekly, Some("Weekly")), (RecordId::new(), Some("Weekly review"))];
        assert_eq!(resolve_record_prefix(entries.into_iter(), "Weekly").unwrap(), weekly);
    }

    #[test]
    fn test_unique_title_prefix() {
        let launch = RecordId::new();
        let entries = vec![(launch, Some("Launch plan")), (RecordId::new(), Some("Retro"))];
        assert_eq!(resolve_record_prefix(entries.into_iter(), "Lau").unwrap(), launch);
    }

    #[test]
    fn test_shared_title_prefix_is_ambiguous() {
        let entries = vec![(RecordId::new(), Some("card-1")), (RecordId::new(), Some("card-2"))];
        let err = resolve_record_prefix(entries.into_iter(), "card").unwrap_err();
        assert!(matches!(err, PrefixError::Ambiguous { candidates, .. } if candidates.len() == 2));
    }

    #[test]
    fn test_hyphenated_id_resolves() {
        let target = RecordId::new();
        let entries = vec![(target, None), (RecordId::new(), None)];
        let query = target.to_string();
        assert_eq!(resolve_record_prefix(entries.into_iter(), &query).unwrap(), target);
    }

    #[test]
    fn test_short_form_differs_for_ids_minted_together() {
        let ids: Vec<_> = (0..32).map(|_| RecordId::new()).collect();
        let shorts: std::collections::HashSet<_> = ids.iter().map(|id| id.short()).collect();
        assert_eq!(shorts.len(), ids.len());
        assert!(ids[0].to_string().replace('-', "").ends_with(&ids[0].short()));
    }

    #[test]
    fn test_short_form_resolves() {
        let target = RecordId::new();
        let entries = vec![(target, Some("Weekly")), (RecordId::new(), Some("Retro"))];
        assert_eq!(resolve_record_prefix(entries.into_iter(), &target.short()).unwrap(), target);
    }

    #[test]
    fn test_unknown_query() {
        let entries = vec![(RecordId::new(), Some("Card"))];
        let err = resolve_record_prefix(entries.into_iter(), "zzzz").unwrap_err();
        assert!(matches!(err, PrefixError::NoMatch(q) if q == "zzzz"));
    }
}

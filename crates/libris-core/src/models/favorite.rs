use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// ============================================================================
// Item identifiers
// ============================================================================

/// Book identifier in normalized numeric form.
///
/// The backend is inconsistent about ids (`2` vs `"2"`), so every id is
/// parsed into a `u64` before it is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct ItemId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid item id: {0:?}")]
pub struct ParseItemIdError(pub String);

impl ItemId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = ParseItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ItemId)
            .map_err(|_| ParseItemIdError(s.to_string()))
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        ItemId(value)
    }
}

/// Anything a caller might hand us as an item id.
pub trait ToItemId {
    fn to_item_id(&self) -> Option<ItemId>;
}

impl ToItemId for ItemId {
    fn to_item_id(&self) -> Option<ItemId> {
        Some(*self)
    }
}

impl ToItemId for str {
    fn to_item_id(&self) -> Option<ItemId> {
        self.parse().ok()
    }
}

impl ToItemId for String {
    fn to_item_id(&self) -> Option<ItemId> {
        self.as_str().to_item_id()
    }
}

macro_rules! integer_item_id {
    ($($t:ty),*) => {$(
        impl ToItemId for $t {
            fn to_item_id(&self) -> Option<ItemId> {
                u64::try_from(*self).ok().map(ItemId)
            }
        }
    )*};
}

integer_item_id!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

impl<T: ToItemId + ?Sized> ToItemId for &T {
    fn to_item_id(&self) -> Option<ItemId> {
        (**self).to_item_id()
    }
}

impl Serialize for ItemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ItemIdVisitor)
    }
}

struct ItemIdVisitor;

impl<'de> Visitor<'de> for ItemIdVisitor {
    type Value = ItemId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or a numeric string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ItemId, E> {
        Ok(ItemId(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ItemId, E> {
        u64::try_from(v)
            .map(ItemId)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ItemId, E> {
        if v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
            Ok(ItemId(v as u64))
        } else {
            Err(E::invalid_value(de::Unexpected::Float(v), &self))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ItemId, E> {
        v.parse()
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

/// One entry of the favorites list. Only the id is inspected; the backend
/// may send it as `id` or `pk`.
#[derive(Debug, Clone, Deserialize)]
pub struct FavoriteRecord {
    #[serde(default)]
    id: Option<ItemId>,
    #[serde(default)]
    pk: Option<ItemId>,
}

impl FavoriteRecord {
    pub fn item_id(&self) -> Option<ItemId> {
        self.id.or(self.pk)
    }
}

/// List endpoint payload: a bare array or a paginated `{results: [...]}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FavoriteList {
    Items(Vec<FavoriteRecord>),
    Paged {
        #[serde(default)]
        results: Vec<FavoriteRecord>,
    },
}

impl FavoriteList {
    /// Ids in server order, records without an id dropped.
    pub fn into_ids(self) -> Vec<ItemId> {
        let records = match self {
            FavoriteList::Items(records) => records,
            FavoriteList::Paged { results } => results,
        };
        records.iter().filter_map(FavoriteRecord::item_id).collect()
    }
}

/// Mutation body for the toggle endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleBody {
    pub item_id: ItemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<bool>,
}

/// Locally held membership of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct MembershipEntry {
    pub id: ItemId,
    /// True while the entry only exists because of an unconfirmed toggle.
    pub optimistic: bool,
}

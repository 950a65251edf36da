//! Wire and domain models.
//!
//! - Auth payloads: `LoginRequest`, `TokenResponse`, `RefreshRequest`
//! - Favorites: `ItemId` (normalized numeric id), list payload shapes,
//!   `ToggleBody`, `MembershipEntry`

pub mod auth;
pub mod favorite;

pub use auth::{ErrorBody, LoginRequest, RefreshRequest, TokenResponse};
pub use favorite::{
    FavoriteList, FavoriteRecord, ItemId, MembershipEntry, ParseItemIdError, ToItemId, ToggleBody,
};

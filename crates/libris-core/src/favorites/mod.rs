//! Favorites: optimistic membership toggles reconciled with the server.

pub mod reconciler;

pub use reconciler::{FavoritesEndpoints, MutationStyle, ToggleReconciler};

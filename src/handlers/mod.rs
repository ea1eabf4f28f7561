//! HTTP handlers for entity CRUD, bulk mutation, import, search and meta.

pub mod bulk;
pub mod entity;
pub mod import;
pub mod search;

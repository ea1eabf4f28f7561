//! Request extractors.

mod identity;

pub use identity::USER_ID_HEADER;

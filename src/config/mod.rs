pub mod types;
pub mod loader;
pub mod validator;
pub mod resolved;
pub mod settings;

pub use types::*;
pub use loader::*;
pub use validator::*;
pub use resolved::*;
pub use settings::{Settings, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

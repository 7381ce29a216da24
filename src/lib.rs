//! Authenticated core for the Lark / Feishu Open Platform.
//!
//! - [`lark`]: tenant token cache, HTTP client, Bitable, Drive and IM calls
//! - [`multipart`]: `multipart/form-data` codec for uploads
//! - [`fields`]: caller keys to Bitable field values
//! - [`notify`]: deadline classification and per-assignee cards

pub mod config;
pub mod error;
pub mod fields;
pub mod lark;
pub mod multipart;
pub mod notify;

pub use config::Config;
pub use error::{LarkError, Result};

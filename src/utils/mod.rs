pub mod links;
pub mod serde_helpers;

pub use links::{display_host, normalize_url};

// Workspace-relative path handling.

pub mod normalize;

pub use normalize::{normalize_path, PathError};

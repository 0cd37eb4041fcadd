// trisync-common: shared types, protocols, and the three-way merge resolver.

pub mod hash;
pub mod merge;
pub mod path;
pub mod protocol;
pub mod types;

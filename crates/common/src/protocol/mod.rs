// Wire protocols: the watcher channel and the observer notification stream.

pub mod events;
pub mod watcher;

//! Topic model and the wildcard routing trie.

pub mod topic;
pub mod trie;

pub use topic::{Filter, FilterLevel, Topic, TopicError};
pub use trie::{RoutePayload, Trie};

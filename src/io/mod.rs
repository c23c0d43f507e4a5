//! I/O: external feed access and deterministic dump output.

mod dump;
mod feed;

pub use dump::{
    DumpRouter, DumpSpec, BOARD_ALL, PLACEHOLDER_BOARD, PLACEHOLDER_RUN, PLACEHOLDER_STAGE,
};
pub use feed::{FeedSource, JsonFileFeeds, MemoryFeeds};

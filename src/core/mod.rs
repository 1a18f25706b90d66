//! Conversation core: the turn loop and everything it coordinates.

pub mod engine;
pub mod events;
pub mod governor;
pub mod spawn;
pub mod tool_parser;
pub mod turn;

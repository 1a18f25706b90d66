//! Agentic command-line assistant.
//!
//! A turn-based conversation with an external model process. The model asks for
//! tools through a line-oriented text protocol ([`crate::core::tool_parser`]); every
//! request passes the [`security::SecurityGate`] before a tool runs, and every
//! model call takes a credential from the rate-aware [`crate::core::governor::Governor`].
//! Committed turns are persisted by the [`session_manager::SessionManager`].

pub mod approval;
pub mod audit;
pub mod client;
pub mod commands;
pub mod config;
pub mod core;
pub mod error_taxonomy;
pub mod eval;
pub mod input;
pub mod llm_client;
pub mod logging;
pub mod prompts;
pub mod security;
pub mod session_manager;
pub mod tools;
pub mod utils;

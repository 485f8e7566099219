//! API endpoints for the LLM orchestrator.

pub mod admin;
pub mod chat;
pub mod completions;
pub mod health;

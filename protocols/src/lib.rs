//! Anthropic Messages API protocol definitions.
//!
//! Wire types shared by the gateway's router, agent loop, and tests.
//! Requests travel through the gateway mostly as raw JSON (transformers may
//! rename arbitrary fields), so these types are the *typed view* used where
//! the gateway actually interprets the dialect: tool interception,
//! continuation message construction, and usage extraction.

pub mod messages;

pub use messages::*;

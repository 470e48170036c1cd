//! Protocol types shared across the gateway.
//!
//! `chat` holds the OpenAI-flavor chat-completion surface the gateway parses
//! on the request path; `error` holds the JSON error envelope the gateway
//! emits on its own behalf.

pub mod chat;
pub mod error;

//! Voice Agent Client Library Crate
//!
//! This library holds the session protocol engine, the audio pipelines and the
//! configuration for the voice agent client. The `voice-agent` binary is a thin
//! wrapper around it.

pub mod audio;
pub mod audio_utils;
pub mod config;
pub mod ws;

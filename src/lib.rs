//! docflow — local document filing daemon.
//!
//! Watches an inbox for finished documents, backs each one up with checksum
//! verification, extracts its text with a vision model, recalls similar past
//! filing decisions, asks a reasoning model where to file it, and moves it
//! into an `output/<year>/<category>/` archive. All model access goes through
//! an arbiter that swaps the vision and reasoning models within a fixed
//! accelerator memory budget; everything runs against a local Ollama
//! instance, nothing leaves the machine.

pub mod arbiter;
pub mod config;
pub mod events;
pub mod hardware;
pub mod memory;
pub mod ollama;
pub mod pipeline;
pub mod watcher;

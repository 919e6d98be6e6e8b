//! Test helper utilities
//!
//! Shared fixtures for the kpipe-worker integration tests

#![allow(dead_code)]

pub mod audio_generator;
pub mod fake_separator;
pub mod harness;

pub use audio_generator::{generate_test_wav, write_corrupted_mp3, write_text_as_mp3, AudioConfig};
pub use fake_separator::FakeSeparator;
pub use harness::{test_config, Harness};

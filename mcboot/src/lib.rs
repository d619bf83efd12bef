//! Mcboot is a library for programmatically bootstrapping and launching vanilla
//! Minecraft clients.
//!
//! The crate revolves around the [`engine::Engine`] state machine: give it a
//! [`engine::LaunchConfig`] and it will diff the local installation against the
//! official distribution metadata, download whatever is missing with bounded
//! parallelism, and finally spawn the game process with the correct class path
//! and arguments.

#![deny(unsafe_op_in_unsafe_fn)]

mod path;
mod http;

pub mod rules;
pub mod layout;
pub mod download;
pub mod catalog;
pub mod engine;

pub use engine::{Engine, LaunchConfig, LaunchState, LaunchCommand, MissingFile,
    DownloadState, DownloadStatus, Handler, Error, Result};

#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod commands;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod guest;
pub mod image;
pub mod lifecycle;
pub mod logging;
pub mod mounts;
pub mod paths;
pub mod preflight;
pub mod state;
pub mod toolstack;
pub mod util;

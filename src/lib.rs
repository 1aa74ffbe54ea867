#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod coalesce;
pub mod config;
pub mod constants;
pub mod conversation;
pub mod document;
pub mod engine;
pub mod json_repair;
pub mod logging;
pub mod main_helper;
pub mod mitigation;
pub mod operator;
pub mod provider;
pub mod segmentation;
pub mod str_utils;
pub mod streaming;
pub mod token_counting;
pub mod tool_calls;
pub mod tools;
pub mod types;

pub use types::*;

pub use main_helper::Args;

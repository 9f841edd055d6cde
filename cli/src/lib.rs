//! regmirror command-line interface.

pub mod commands;
pub mod images;

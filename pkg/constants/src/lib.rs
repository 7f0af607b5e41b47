//! Centralized constants for the mtq project.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod controller;
pub mod paths;
pub mod resources;
pub mod state;

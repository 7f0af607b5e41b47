//! Object model shared by the state store and the migration quota controller.

pub mod config;
pub mod grant;
pub mod migration;
pub mod object;
pub mod pod;
pub mod quantity;
pub mod quota;
pub mod resource;

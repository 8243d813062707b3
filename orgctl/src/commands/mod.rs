//! Command implementations

pub mod ctl;
pub mod race;
pub mod select;

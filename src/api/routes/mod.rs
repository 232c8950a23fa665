//! API route modules.

pub mod meetings;

//! Interfaces between the sync layer and the subsystems it relies on but
//! does not implement: unit validation, catch-up proof checking, device
//! message relaying and light client serving.

pub mod catchup;
pub mod events;
pub mod services;
pub mod validation;

pub mod ball;
pub mod common;
pub mod constants;
pub mod hash;
pub mod id;
pub mod joint;
pub mod peer;

pub mod catchup;
pub mod codec;
pub mod frame;
pub mod payloads;

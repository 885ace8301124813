#![forbid(unsafe_code)]

pub mod keys;
pub mod secret;
pub mod utils;
pub mod verify;

#[cfg(test)]
mod proptests;

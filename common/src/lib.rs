#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod accumulator;
pub mod cursor;
pub mod errors;
pub mod message;
pub mod psbt;

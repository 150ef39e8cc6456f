#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod constants;
pub mod device;
pub mod handlers;
pub mod hash;
pub mod hostio;
pub mod keys;
pub mod merkle_map;
pub mod rawtx;

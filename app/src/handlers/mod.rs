//! Command handlers.

pub mod sign_psbt;

pub use sign_psbt::handle_sign_psbt;

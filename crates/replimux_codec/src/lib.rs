#![doc = include_str!("../README.md")]

pub mod ascii;
pub mod inline;

pub use ascii::ASCII;
pub use inline::INLINE;

pub(crate) mod scan;

#![doc = include_str!("../README.md")]

pub mod chain;
pub mod conn;
pub mod dmsg;
pub mod engine;
pub mod mbuf;
pub mod msg;
pub mod pool;
pub mod proto;
pub mod recv;
pub mod send;
pub mod timeout;

mod frag;
mod parse;

#[cfg(test)]
mod testutil;

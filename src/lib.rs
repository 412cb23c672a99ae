#![cfg_attr(feature = "no_std", no_std)]

#[macro_use]
extern crate bitflags;

pub mod error;
pub mod heap;
pub mod interrupt;
pub mod page;
pub mod signal;
pub mod thread;

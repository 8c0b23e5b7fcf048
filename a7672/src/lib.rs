#![cfg_attr(not(test), no_std)]

//! # a7672
//!
//! This crate drives SIMCom [A76xx](https://www.simcom.com/product/A7672X.html)
//! series LTE Cat-1 cellular modules over their AT command interface: power
//! sequencing, SIM and signal queries, network registration, and data
//! transfer through the module's built-in HTTP and MQTT stacks.
//! It can be used both on `no_std` and `std` platforms.
//!
//! The modem is attached through any byte stream implementing the
//! [`SerialPort`] trait (an UART, or an I2C-bridged UART expander). All
//! waiting is expressed through `embassy-time`, so the driver cooperates with
//! whatever single-threaded executor the firmware runs on.

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod at;
mod config;
mod error;
mod http;
mod modem;
mod mqtt;
mod parse;
mod registration;
mod serial;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use at::*;
pub use config::*;
pub use error::*;
pub use modem::*;
pub use serial::*;
pub use types::*;

pub mod prelude {
    pub use crate::at::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::modem::*;
    pub use crate::serial::*;
    pub use crate::types::*;
}

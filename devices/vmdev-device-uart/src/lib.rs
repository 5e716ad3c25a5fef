/*
 *  vmdev serial port plugin
 *
 *  A loadable device module for the vmdev runtime providing a simple
 *  interrupt-driven serial port.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 */

//! # Serial port device module
//!
//! Models a byte-oriented peripheral with independent inbound and
//! outbound flow control:
//!
//! - a bounded receive queue the host feeds (`write` method / `push_rx`)
//!   and the guest drains through its data register,
//! - a bounded transmit queue the guest fills and the host drains
//!   (`read` method / `pop_tx`),
//! - a poll bitmask and an IRQ raised on every flag transition.
//!
//! Both queues truncate silently when full — overrun on a real wire
//! drops bytes, and so does this one.
//!
//! ## Scripting surface
//!
//! `vm.devices.uart_create(machine_id, address [, console])` attaches the
//! device at `address` and returns a handle with `write`, `read` and
//! `poll` methods. Passing `console = true` marks the device as the boot
//! console in the guest device tree.

mod chardev;
mod plugin;

pub use chardev::{QueuePair, QUEUE_CAPACITY, RX_READY, TX_SPACE};
pub use plugin::{
    device_abi_version, device_close, device_get_name, device_get_version, device_init,
    device_register_functions,
};

/*
 *  vmdev web framebuffer plugin
 *
 *  A loadable device module for the vmdev runtime that streams guest
 *  pixel memory to HTTP viewers as motion JPEG.
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 */

//! # Web framebuffer device module
//!
//! The guest writes pixels (a8r8g8b8) straight into a direct-mapped MMIO
//! region. Thirty times a second the module snapshots that memory,
//! compresses it to JPEG and hands the frame to every connected HTTP
//! viewer as one part of a `multipart/x-mixed-replace` stream.
//!
//! Everything network- and timer-shaped runs on one current-thread tokio
//! runtime the host polls cooperatively from its per-tick hook — the
//! module never spawns a free-running thread. Slow viewers simply miss
//! frames: the newest frame replaces the previous one atomically and no
//! per-viewer queue exists, so memory stays bounded no matter how many
//! viewers connect or how slow they are.
//!
//! ## Scripting surface
//!
//! `vm.devices.web_fb_create(machine_id, address, width, height [, port])`
//! attaches the pixel region, publishes a `simple-framebuffer` device-tree
//! node, and serves `GET /stream` on the given port (default 8001).

mod broadcaster;
mod plugin;
mod server;

pub use plugin::{
    device_abi_version, device_close, device_get_name, device_get_version, device_init,
    device_register_functions,
};

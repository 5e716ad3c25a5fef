/*
 *  vmdev web framebuffer plugin - module entry points and event loop
 */

use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::runtime::Runtime;
use tokio::sync::watch;
use vmdev_api::{
    abi_pack, FdtProp, HostApi, HostRef, MmioRegion, ScriptValue, VMDEV_ABI_MAJOR, VMDEV_ABI_MINOR,
};

use crate::broadcaster::{encode_loop, PixelBuffer, BYTES_PER_PIXEL};
use crate::server::serve;

const DEVICE_NAME: &CStr = c"web_fb";
const DEVICE_VERSION: c_int = 1;
const DEFAULT_PORT: u16 = 8001;
const MAX_DIMENSION: i64 = 4096;

/// Scheduler turns granted per host tick. The loop makes progress only
/// while the host polls it; each turn drains whatever is ready without
/// blocking.
const POLL_BUDGET: u32 = 4;

static HOST: Mutex<Option<HostRef>> = Mutex::new(None);

/// The module's event loop: one current-thread runtime carrying every
/// timer and socket of every framebuffer instance, driven from the
/// host's tick hook. Created in `init`, torn down in `close`.
static RUNTIME: Mutex<Option<Runtime>> = Mutex::new(None);

/// One attached framebuffer. Owned by the VM once attached; the `remove`
/// callback is the sole deallocation path. Pixel memory is `Arc`-shared
/// with the encode task, so teardown cannot free it under a tick that is
/// still in flight.
struct WebFb {
    live: Arc<PixelBuffer>,
    width: u32,
    height: u32,
    port: u16,
    closing_tx: watch::Sender<bool>,
    clients: Arc<AtomicUsize>,
    mmio: AtomicPtr<MmioRegion>,
}

// SAFETY: everything inside is channels, atomics and Arc'd raw pixel
// memory whose unsynchronized sharing is the device's documented model.
unsafe impl Send for WebFb {}
unsafe impl Sync for WebFb {}

fn contain<R>(default: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error!("panic contained in framebuffer callback");
            default
        }
    }
}

/// Drive the event loop for a bounded number of scheduler turns. Must
/// return promptly even with zero pending events, and it does: a turn is
/// one `yield_now`, not a wait.
extern "C-unwind" fn webfb_poll(_data: *mut c_void) {
    if let Some(runtime) = RUNTIME.lock().unwrap().as_ref() {
        runtime.block_on(async {
            for _ in 0..POLL_BUDGET {
                tokio::task::yield_now().await;
            }
        });
    }
}

/// Sole deallocation path, invoked by the VM.
///
/// Shutdown order: closing flag first (every listener and the encode
/// timer observe it and stop), then one final drive of the loop to flush
/// the close sequence when the loop is free, then the buffers go — the
/// `Arc` keeps pixel memory alive for any task still mid-tick.
extern "C" fn webfb_remove(dev: *mut MmioRegion) {
    contain((), || unsafe {
        if dev.is_null() {
            return;
        }
        let data = (*dev).data;
        if data.is_null() {
            return;
        }
        (*dev).data = std::ptr::null_mut();
        let fb = Box::from_raw(data as *mut WebFb);
        debug_assert_eq!(fb.mmio.load(Ordering::Acquire), dev);

        let _ = fb.closing_tx.send(true);
        // try_lock: when the VM removes us from another thread while a
        // poll is running, the tasks drain on the next host tick instead.
        if let Ok(guard) = RUNTIME.try_lock() {
            if let Some(runtime) = guard.as_ref() {
                runtime.block_on(async {
                    for _ in 0..POLL_BUDGET {
                        tokio::task::yield_now().await;
                    }
                });
            }
        }
        debug!(
            "framebuffer {}x{} ({} bytes) on port {} removed, {} viewer(s) closing",
            fb.width,
            fb.height,
            fb.live.len(),
            fb.port,
            fb.clients.load(Ordering::SeqCst)
        );
        drop(fb);
    })
}

/// `web_fb_create(machine_id, address, width, height [, port])`
extern "C-unwind" fn web_fb_create(
    args: *const ScriptValue,
    nargs: usize,
    ret: *mut ScriptValue,
    _data: *mut c_void,
) -> c_int {
    let args = unsafe { std::slice::from_raw_parts(args, nargs) };
    let Some(host) = *HOST.lock().unwrap() else { return 1 };

    let (Some(machine_id), Some(addr), Some(width), Some(height)) = (
        args.first().and_then(|v| v.as_int()),
        args.get(1).and_then(|v| v.as_int()).filter(|a| *a >= 0),
        args.get(2).and_then(|v| v.as_int()).filter(|w| (1..=MAX_DIMENSION).contains(w)),
        args.get(3).and_then(|v| v.as_int()).filter(|h| (1..=MAX_DIMENSION).contains(h)),
    ) else {
        return 1;
    };
    let port = match args.get(4).and_then(|v| v.as_int()) {
        Some(p) if (1..=i64::from(u16::MAX)).contains(&p) => p as u16,
        _ => DEFAULT_PORT,
    };

    let vm = *host.vm();
    let machine = (vm.get_machine)(machine_id);
    if machine.is_null() {
        unsafe { *ret = ScriptValue::from_bool(false) };
        return 0;
    }

    // Everything that can refuse does so before the region is attached.
    if RUNTIME.lock().unwrap().is_none() {
        error!("framebuffer event loop is not running");
        unsafe { *ret = ScriptValue::from_bool(false) };
        return 0;
    }
    let listener = match std::net::TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => listener,
        Err(err) => {
            warn!("framebuffer port {} unavailable: {}", port, err);
            unsafe { *ret = ScriptValue::from_bool(false) };
            return 0;
        }
    };

    let (width_px, height_px) = (width as u32, height as u32);
    let size = width_px as usize * height_px as usize * BYTES_PER_PIXEL;
    let live = Arc::new(PixelBuffer::zeroed(size));
    let (frame_tx, frame_rx) = watch::channel(Bytes::new());
    let (closing_tx, closing_rx) = watch::channel(false);
    let clients = Arc::new(AtomicUsize::new(0));

    let fb = Box::new(WebFb {
        live: Arc::clone(&live),
        width: width_px,
        height: height_px,
        port,
        closing_tx,
        clients: Arc::clone(&clients),
        mmio: AtomicPtr::new(std::ptr::null_mut()),
    });
    let data = Box::into_raw(fb) as *mut c_void;

    let mut region = MmioRegion::zeroed();
    region.addr = addr as u64;
    region.size = size as u64;
    region.mapping = live.as_ptr() as *mut c_void;
    region.data = data;
    region.remove = Some(webfb_remove);
    region.min_op_size = 1;
    region.max_op_size = 8;
    region.type_name = DEVICE_NAME.as_ptr();

    let attached = (vm.attach_mmio)(machine, &region);
    if attached.is_null() {
        warn!("framebuffer attach at {:#x} refused", addr);
        drop(unsafe { Box::from_raw(data as *mut WebFb) });
        unsafe { *ret = ScriptValue::from_bool(false) };
        return 0;
    }
    unsafe { &*(data as *const WebFb) }.mmio.store(attached, Ordering::Release);

    let props = [
        FdtProp::reg(c"reg", addr as u64, size as u64),
        FdtProp::str(c"compatible", c"simple-framebuffer"),
        FdtProp::str(c"format", c"a8r8g8b8"),
        FdtProp::u32(c"width", width_px),
        FdtProp::u32(c"height", height_px),
        FdtProp::u32(c"stride", width_px * BYTES_PER_PIXEL as u32),
    ];
    (vm.fdt_add_node)(machine, c"/soc".as_ptr(), c"framebuffer".as_ptr(), props.as_ptr(), props.len());

    if let Some(runtime) = RUNTIME.lock().unwrap().as_ref() {
        runtime.spawn(encode_loop(live, width_px, height_px, frame_tx, closing_rx.clone()));
        runtime.spawn(serve(listener, frame_rx, closing_rx, clients));
    }

    debug!(
        "framebuffer {}x{} attached at {:#x}, streaming on port {}",
        width_px, height_px, addr, port
    );
    unsafe { *ret = ScriptValue::from_bool(true) };
    0
}

// ---------------------------------------------------------------------------
// Module entry points
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn device_get_name() -> *const c_char {
    DEVICE_NAME.as_ptr()
}

#[no_mangle]
pub extern "C" fn device_get_version() -> c_int {
    DEVICE_VERSION
}

#[no_mangle]
pub extern "C" fn device_abi_version() -> u32 {
    abi_pack(VMDEV_ABI_MAJOR, VMDEV_ABI_MINOR)
}

#[no_mangle]
pub extern "C-unwind" fn device_init(host: *const HostApi) {
    let Some(host) = (unsafe { HostRef::new(host) }) else { return };

    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => *RUNTIME.lock().unwrap() = Some(runtime),
        Err(err) => {
            error!("framebuffer event loop failed to start: {}", err);
            return;
        }
    }

    host.add_tick_hook(c"web_fb_poll", webfb_poll, std::ptr::null_mut());
    *HOST.lock().unwrap() = Some(host);
}

#[no_mangle]
pub extern "C-unwind" fn device_register_functions(host: *const HostApi) {
    let Some(host) = (unsafe { HostRef::new(host) }) else { return };
    host.set_callable(c"web_fb_create", web_fb_create, std::ptr::null_mut());
}

#[no_mangle]
pub extern "C-unwind" fn device_close(host: *const HostApi) {
    let Some(host) = (unsafe { HostRef::new(host) }) else { return };
    host.remove(c"web_fb_create");
    host.remove_tick_hook(c"web_fb_poll");

    if let Some(runtime) = RUNTIME.lock().unwrap().take() {
        // Abandon whatever is still parked; sockets close with it.
        runtime.shutdown_background();
    }
    *HOST.lock().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;
    use vmdev_api::testing::{create_machine, destroy_machine, mock_vm_api};
    use vmdev_api::{NamespaceApi, ScriptFn, TickFn};

    // The module statics (runtime, host) are shared; run these tests one
    // at a time.
    static SERIAL: Mutex<()> = Mutex::new(());

    extern "C" fn stub_set_callable(
        _ctx: *mut c_void,
        _name: *const c_char,
        _func: ScriptFn,
        _data: *mut c_void,
    ) -> bool {
        true
    }
    extern "C" fn stub_remove(_ctx: *mut c_void, _name: *const c_char) -> bool {
        true
    }
    extern "C" fn stub_create_type(_ctx: *mut c_void, _name: *const c_char) -> u32 {
        1
    }
    extern "C" fn stub_type_set_method(
        _ctx: *mut c_void,
        _type_id: u32,
        _name: *const c_char,
        _func: ScriptFn,
        _data: *mut c_void,
    ) -> bool {
        true
    }
    extern "C" fn stub_add_tick_hook(
        _ctx: *mut c_void,
        _name: *const c_char,
        _func: TickFn,
        _data: *mut c_void,
    ) -> bool {
        true
    }
    extern "C" fn stub_remove_tick_hook(_ctx: *mut c_void, _name: *const c_char) -> bool {
        true
    }

    fn stub_host_api() -> HostApi {
        HostApi {
            abi_major: VMDEV_ABI_MAJOR,
            abi_minor: VMDEV_ABI_MINOR,
            ns: NamespaceApi {
                set_callable: stub_set_callable,
                remove: stub_remove,
                create_type: stub_create_type,
                type_set_method: stub_type_set_method,
                add_tick_hook: stub_add_tick_hook,
                remove_tick_hook: stub_remove_tick_hook,
            },
            vm: mock_vm_api(),
            ctx: std::ptr::null_mut(),
        }
    }

    fn create_fb(machine_id: i64, addr: i64, w: i64, h: i64, port: i64) -> Option<bool> {
        let args = [
            ScriptValue::from_int(machine_id),
            ScriptValue::from_int(addr),
            ScriptValue::from_int(w),
            ScriptValue::from_int(h),
            ScriptValue::from_int(port),
        ];
        let mut ret = ScriptValue::nil();
        (web_fb_create(args.as_ptr(), args.len(), &mut ret, std::ptr::null_mut()) == 0)
            .then(|| ret.as_bool())
            .flatten()
    }

    fn read_one_part(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 2048];
        // Response headers, then one full part; chunked framing from the
        // HTTP layer may interleave size lines, so scan for the JPEG
        // payload by its Content-Length.
        loop {
            let n = stream.read(&mut buf).expect("viewer read failed");
            assert!(n > 0, "stream closed before a frame arrived");
            collected.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&collected).into_owned();
            if let Some(pos) = text.find("Content-Length: ") {
                let rest = &text[pos + "Content-Length: ".len()..];
                if let Some(end) = rest.find('\r') {
                    if let Ok(len) = rest[..end].parse::<usize>() {
                        if let Some(body_at) = find_subslice(&collected, b"\r\n\r\n", pos) {
                            let start = body_at + 4;
                            if collected.len() >= start + len {
                                return collected[start..start + len].to_vec();
                            }
                        }
                    }
                }
            }
        }
    }

    fn find_subslice(data: &[u8], needle: &[u8], from: usize) -> Option<usize> {
        data[from..]
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|p| p + from)
    }

    #[test]
    fn streams_encoded_guest_pixels_to_a_viewer() {
        let _guard = SERIAL.lock().unwrap();
        let machine = create_machine(9201);
        let api = stub_host_api();
        device_init(&api);
        device_register_functions(&api);

        const ADDR: i64 = 0x4000_0000;
        const PORT: i64 = 18021;
        assert_eq!(create_fb(9201, ADDR, 32, 16, PORT), Some(true));
        assert_eq!(machine.attached_count(), 1);

        let fdt = machine.fdt_lines();
        assert!(fdt.iter().any(|l| l.contains("compatible=\"simple-framebuffer\"")));
        assert!(fdt.iter().any(|l| l.contains("stride=128")));

        // Paint the guest-visible memory solid blue (BGRA).
        let mapping = machine.mapping_at(ADDR as u64).expect("region is direct-mapped");
        for i in 0..(32 * 16) {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    [0xFFu8, 0x00, 0x00, 0xFF].as_ptr(),
                    mapping.add(i * BYTES_PER_PIXEL),
                    BYTES_PER_PIXEL,
                );
            }
        }

        // Viewer on its own thread; the loop only advances when polled.
        let client = std::thread::spawn(|| {
            let mut stream = std::net::TcpStream::connect(("127.0.0.1", PORT as u16))
                .expect("connect to stream");
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .expect("set read timeout");
            stream
                .write_all(b"GET /stream HTTP/1.1\r\nHost: test\r\n\r\n")
                .expect("send request");
            read_one_part(&mut stream)
        });

        for _ in 0..400 {
            webfb_poll(std::ptr::null_mut());
            if client.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let jpeg = client.join().expect("viewer thread");

        let decoded = image::load_from_memory(&jpeg).expect("valid jpeg frame").to_rgb8();
        assert_eq!(decoded.dimensions(), (32, 16));
        let px = decoded.get_pixel(16, 8);
        assert!(px[2] > 200 && px[0] < 60, "expected blue, decoded {:?}", px);

        machine.detach_all();
        device_close(&api);
        destroy_machine(9201);
    }

    #[test]
    fn rejects_bad_dimensions_and_unknown_machines() {
        let _guard = SERIAL.lock().unwrap();
        let machine = create_machine(9202);
        let api = stub_host_api();
        device_init(&api);

        // Zero width is a caller error, not a false return.
        let args = [
            ScriptValue::from_int(9202),
            ScriptValue::from_int(0x4000_0000),
            ScriptValue::from_int(0),
            ScriptValue::from_int(16),
        ];
        let mut ret = ScriptValue::nil();
        assert_ne!(web_fb_create(args.as_ptr(), args.len(), &mut ret, std::ptr::null_mut()), 0);

        // Unknown machine degrades to `false`.
        assert_eq!(create_fb(424242, 0x4000_0000, 32, 16, 18022), Some(false));
        assert_eq!(machine.attached_count(), 0);

        device_close(&api);
        destroy_machine(9202);
    }
}

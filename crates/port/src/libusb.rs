//! libusb-1.0 backend
//!
//! Drives the four transfer roles with libusb's asynchronous transfer API
//! through `rusb::ffi`. The synchronous `rusb` calls cannot cancel an
//! in-flight transfer, and cancellation is the foundation of the abort
//! sequences, so each role owns a pre-allocated native transfer and a
//! stable buffer; completions land in a queue from the libusb callback and
//! are drained by `handle_events`.
//!
//! Device selection walks the bus for the VID/PID pair, disambiguates by
//! serial number when one is given, detaches an active kernel driver and
//! claims the USBTMC interface. Endpoints come from the active
//! configuration descriptor: a bulk-IN endpoint is required, bulk-OUT is
//! preferred over interrupt-OUT for the write pipe, and an extra
//! interrupt-IN endpoint becomes the message channel.

use crate::address::DeviceAddress;
use crate::backend::{Completion, EndpointInfo, HostStatus, SubmitRequest, TransferKind, UsbHost};
use crate::config::PortConfig;
use common::{PortError, TransferRole};
use protocol::{SETUP_PACKET_SIZE, USBTMC_CLASS, USBTMC_SUBCLASS};
use rusb::constants::{
    LIBUSB_ERROR_BUSY, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_NO_DEVICE,
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
    LIBUSB_TRANSFER_TYPE_BULK, LIBUSB_TRANSFER_TYPE_CONTROL, LIBUSB_TRANSFER_TYPE_INTERRUPT,
};
use rusb::{ffi, Context, Device, DeviceHandle, UsbContext};
use std::collections::VecDeque;
use std::os::raw::{c_int, c_uint, c_void};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Control responses never exceed the 8-byte CHECK_ABORT status
const CONTROL_DATA_CAPACITY: usize = 64;

struct RawCompletion {
    role: TransferRole,
    status: c_int,
    actual_length: usize,
    data: Vec<u8>,
}

type CompletionQueue = Arc<Mutex<VecDeque<RawCompletion>>>;

/// Passed to the libusb callback through `user_data`; owned by the slot
struct CallbackContext {
    role: TransferRole,
    queue: CompletionQueue,
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // Safety: user_data points at the CallbackContext boxed by the owning
    // TransferSlot, which outlives the native transfer; buffer is the
    // slot's stable allocation.
    unsafe {
        let ctx = &*((*transfer).user_data as *const CallbackContext);
        let status = (*transfer).status;
        let actual_length = (*transfer).actual_length.max(0) as usize;

        let data = if status == LIBUSB_TRANSFER_COMPLETED {
            match ctx.role {
                TransferRole::BulkIn | TransferRole::MessageIn => {
                    std::slice::from_raw_parts((*transfer).buffer, actual_length).to_vec()
                }
                TransferRole::Control => {
                    // IN data sits after the setup packet; OUT has none
                    if *(*transfer).buffer & 0x80 != 0 {
                        std::slice::from_raw_parts(
                            (*transfer).buffer.add(SETUP_PACKET_SIZE),
                            actual_length,
                        )
                        .to_vec()
                    } else {
                        Vec::new()
                    }
                }
                TransferRole::BulkOut => Vec::new(),
            }
        } else {
            Vec::new()
        };

        if let Ok(mut queue) = ctx.queue.lock() {
            queue.push_back(RawCompletion {
                role: ctx.role,
                status,
                actual_length,
                data,
            });
        }
    }
}

/// One native transfer with its buffer and callback context
struct TransferSlot {
    transfer: *mut ffi::libusb_transfer,
    buffer: Vec<u8>,
    context: *mut CallbackContext,
}

impl TransferSlot {
    fn new(role: TransferRole, buffer_len: usize, queue: CompletionQueue) -> Result<Self, PortError> {
        // Safety: 0 iso packets; null check below
        let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(PortError::Setup("libusb transfer allocation failed".into()));
        }
        let context = Box::into_raw(Box::new(CallbackContext { role, queue }));
        Ok(Self {
            transfer,
            buffer: vec![0u8; buffer_len],
            context,
        })
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        // Safety: both pointers were created in new() and are dropped once
        unsafe {
            ffi::libusb_free_transfer(self.transfer);
            drop(Box::from_raw(self.context));
        }
    }
}

pub struct LibusbHost {
    context: Context,
    handle: DeviceHandle<Context>,
    address: DeviceAddress,
    kernel_driver_detached: bool,
    bulk_in: EndpointInfo,
    bulk_out: EndpointInfo,
    message_in: Option<EndpointInfo>,
    control_slot: TransferSlot,
    read_slot: TransferSlot,
    write_slot: TransferSlot,
    message_slot: Option<TransferSlot>,
    queue: CompletionQueue,
}

// Safety: the raw transfer and context pointers are used exclusively from
// the worker thread; the libusb callback runs inside handle_events on that
// same thread.
unsafe impl Send for LibusbHost {}

impl LibusbHost {
    /// Open the device named by `address` and prepare the native transfers
    pub fn open(address: &DeviceAddress, config: &PortConfig) -> Result<Self, PortError> {
        let context = Context::new()
            .map_err(|e| PortError::Setup(format!("libusb init failed: {}", e)))?;
        let (handle, detached, bulk_in, bulk_out, message_in) =
            attach(&context, address)?;

        info!(
            device = %address,
            bulk_in = format_args!("{:#04x}", bulk_in.address),
            bulk_out = format_args!("{:#04x}", bulk_out.address),
            message_in = message_in.is_some(),
            "device opened"
        );

        let queue: CompletionQueue = Arc::new(Mutex::new(VecDeque::new()));
        let control_slot = TransferSlot::new(
            TransferRole::Control,
            SETUP_PACKET_SIZE + CONTROL_DATA_CAPACITY,
            Arc::clone(&queue),
        )?;
        let read_slot = TransferSlot::new(
            TransferRole::BulkIn,
            config.read_frame_size.max(bulk_in.max_packet_size),
            Arc::clone(&queue),
        )?;
        let write_slot = TransferSlot::new(
            TransferRole::BulkOut,
            config.write_frame_size,
            Arc::clone(&queue),
        )?;
        let message_slot = match message_in {
            Some(info) => Some(TransferSlot::new(
                TransferRole::MessageIn,
                info.max_packet_size,
                Arc::clone(&queue),
            )?),
            None => None,
        };

        Ok(Self {
            context,
            handle,
            address: address.clone(),
            kernel_driver_detached: detached,
            bulk_in,
            bulk_out,
            message_in,
            control_slot,
            read_slot,
            write_slot,
            message_slot,
            queue,
        })
    }

    fn slot_mut(&mut self, role: TransferRole) -> Result<&mut TransferSlot, PortError> {
        match role {
            TransferRole::Control => Ok(&mut self.control_slot),
            TransferRole::BulkIn => Ok(&mut self.read_slot),
            TransferRole::BulkOut => Ok(&mut self.write_slot),
            TransferRole::MessageIn => self
                .message_slot
                .as_mut()
                .ok_or_else(|| PortError::Setup("interface has no message channel".into())),
        }
    }

    fn fill_and_submit(
        &mut self,
        role: TransferRole,
        endpoint: u8,
        transfer_type: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<(), PortError> {
        let dev_handle = self.handle.as_raw();
        let slot = self.slot_mut(role)?;
        // Safety: slot.transfer was allocated in TransferSlot::new; the
        // buffer outlives the transfer because both live in the slot
        unsafe {
            let t = slot.transfer;
            (*t).dev_handle = dev_handle;
            (*t).endpoint = endpoint;
            (*t).transfer_type = transfer_type;
            (*t).timeout = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
            (*t).status = 0;
            (*t).length = length as c_int;
            (*t).actual_length = 0;
            (*t).callback = transfer_callback;
            (*t).user_data = slot.context as *mut c_void;
            (*t).buffer = slot.buffer.as_mut_ptr();
            (*t).flags = 0;
            (*t).num_iso_packets = 0;
            map_submit_rc(ffi::libusb_submit_transfer(t))
        }
    }

    fn release_device(&mut self) {
        let _ = self.handle.release_interface(self.address.interface);
        if self.kernel_driver_detached {
            let _ = self.handle.attach_kernel_driver(self.address.interface);
        }
    }
}

impl UsbHost for LibusbHost {
    fn submit(&mut self, role: TransferRole, request: SubmitRequest<'_>) -> Result<(), PortError> {
        match request {
            SubmitRequest::Control { setup, data, timeout } => {
                let needed = SETUP_PACKET_SIZE + data.len().max(usize::from(setup.length));
                let slot = self.slot_mut(role)?;
                if slot.buffer.len() < needed {
                    slot.buffer.resize(needed, 0);
                }
                slot.buffer[..SETUP_PACKET_SIZE].copy_from_slice(&setup.encode());
                slot.buffer[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + data.len()]
                    .copy_from_slice(data);
                debug!(
                    request = setup.request,
                    value = setup.value,
                    index = setup.index,
                    "submitting control transfer"
                );
                self.fill_and_submit(role, 0, LIBUSB_TRANSFER_TYPE_CONTROL, needed, timeout)
            }
            SubmitRequest::BulkOut { data, timeout } => {
                let endpoint = self.bulk_out.address;
                let transfer_type = native_type(self.bulk_out.kind);
                let slot = self.slot_mut(role)?;
                if slot.buffer.len() < data.len() {
                    slot.buffer.resize(data.len(), 0);
                }
                slot.buffer[..data.len()].copy_from_slice(data);
                self.fill_and_submit(role, endpoint, transfer_type, data.len(), timeout)
            }
            SubmitRequest::BulkIn { max_len, timeout } => {
                let endpoint = self.bulk_in.address;
                let transfer_type = native_type(self.bulk_in.kind);
                let slot = self.slot_mut(role)?;
                let length = max_len.min(slot.buffer.len().max(1));
                if slot.buffer.len() < length {
                    slot.buffer.resize(length, 0);
                }
                self.fill_and_submit(role, endpoint, transfer_type, length, timeout)
            }
            SubmitRequest::MessageIn { max_len, timeout } => {
                let info = self.message_in.ok_or_else(|| {
                    PortError::Setup("interface has no message channel".into())
                })?;
                let slot = self.slot_mut(role)?;
                let length = max_len.min(slot.buffer.len().max(1));
                self.fill_and_submit(
                    role,
                    info.address,
                    LIBUSB_TRANSFER_TYPE_INTERRUPT,
                    length,
                    timeout,
                )
            }
        }
    }

    fn cancel(&mut self, role: TransferRole) -> Result<(), PortError> {
        let slot = self.slot_mut(role)?;
        // Safety: the transfer pointer stays valid for the slot's lifetime
        let rc = unsafe { ffi::libusb_cancel_transfer(slot.transfer) };
        match rc {
            0 => Ok(()),
            // Already complete or never submitted
            LIBUSB_ERROR_NOT_FOUND => Ok(()),
            LIBUSB_ERROR_NO_DEVICE => Err(PortError::Disconnected),
            other => Err(PortError::Unhandled(format!(
                "libusb_cancel_transfer failed: {}",
                other
            ))),
        }
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), PortError> {
        let result = match self.context.handle_events(Some(timeout)) {
            Ok(()) => Ok(()),
            Err(rusb::Error::Interrupted) => Ok(()),
            Err(rusb::Error::NoDevice) => Err(PortError::Disconnected),
            Err(e) => Err(PortError::Unhandled(format!("libusb event loop: {}", e))),
        };

        if let Ok(mut queue) = self.queue.lock() {
            while let Some(raw) = queue.pop_front() {
                completions.push(Completion {
                    role: raw.role,
                    status: map_transfer_status(raw.status),
                    data: raw.data,
                    actual_length: raw.actual_length,
                });
            }
        }
        result
    }

    fn reconnect(&mut self, delay: Duration) -> Result<(), PortError> {
        self.release_device();
        thread::sleep(delay);

        let (handle, detached, bulk_in, bulk_out, message_in) =
            attach(&self.context, &self.address).map_err(|e| {
                debug!(error = %e, "reopen failed");
                PortError::Disconnected
            })?;
        self.handle = handle;
        self.kernel_driver_detached = detached;
        self.bulk_in = bulk_in;
        self.bulk_out = bulk_out;
        self.message_in = message_in;
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        Ok(())
    }

    fn endpoint(&self, role: TransferRole) -> Option<EndpointInfo> {
        match role {
            TransferRole::Control => Some(EndpointInfo {
                address: 0,
                max_packet_size: CONTROL_DATA_CAPACITY,
                kind: TransferKind::Bulk,
            }),
            TransferRole::BulkIn => Some(self.bulk_in),
            TransferRole::BulkOut => Some(self.bulk_out),
            TransferRole::MessageIn => self.message_in,
        }
    }
}

impl Drop for LibusbHost {
    fn drop(&mut self) {
        self.release_device();
    }
}

/// Open the device, detach its kernel driver, claim the interface and
/// resolve the endpoint layout
fn attach(
    context: &Context,
    address: &DeviceAddress,
) -> Result<
    (
        DeviceHandle<Context>,
        bool,
        EndpointInfo,
        EndpointInfo,
        Option<EndpointInfo>,
    ),
    PortError,
> {
    let mut handle = open_matching_device(context, address)?;
    let (bulk_in, bulk_out, message_in) =
        discover_endpoints(&handle.device(), address.interface)?;

    let mut detached = false;
    match handle.kernel_driver_active(address.interface) {
        Ok(true) => {
            debug!(interface = address.interface, "detaching kernel driver");
            handle.detach_kernel_driver(address.interface).map_err(|e| {
                PortError::Setup(format!("Failed to detach kernel driver: {}", e))
            })?;
            detached = true;
        }
        Ok(false) => {}
        // Not supported on all platforms
        Err(e) => debug!(error = %e, "could not query kernel driver state"),
    }

    handle
        .claim_interface(address.interface)
        .map_err(|e| PortError::Setup(format!("Failed to claim interface: {}", e)))?;

    Ok((handle, detached, bulk_in, bulk_out, message_in))
}

fn open_matching_device(
    context: &Context,
    address: &DeviceAddress,
) -> Result<DeviceHandle<Context>, PortError> {
    let devices = context
        .devices()
        .map_err(|e| PortError::Setup(format!("Failed to list devices: {}", e)))?;

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != address.vendor_id
            || descriptor.product_id() != address.product_id
        {
            continue;
        }
        let handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                warn!(
                    bus = device.bus_number(),
                    addr = device.address(),
                    error = %e,
                    "matching device could not be opened"
                );
                continue;
            }
        };
        if let Some(wanted) = &address.serial {
            match handle.read_serial_number_string_ascii(&descriptor) {
                Ok(serial) if serial == *wanted => {}
                Ok(other) => {
                    debug!(serial = %other, "serial number does not match, skipping");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "could not read serial number, skipping");
                    continue;
                }
            }
        }
        return Ok(handle);
    }

    Err(PortError::Setup(format!("No device matching {}", address)))
}

/// Resolve the data endpoints of the USBTMC interface
fn discover_endpoints(
    device: &Device<Context>,
    interface: u8,
) -> Result<(EndpointInfo, EndpointInfo, Option<EndpointInfo>), PortError> {
    let config = device
        .active_config_descriptor()
        .map_err(|e| PortError::Setup(format!("No active configuration: {}", e)))?;

    for group in config.interfaces() {
        if group.number() != interface {
            continue;
        }
        for descriptor in group.descriptors() {
            if descriptor.class_code() != USBTMC_CLASS
                || descriptor.sub_class_code() != USBTMC_SUBCLASS
            {
                warn!(
                    interface,
                    class = descriptor.class_code(),
                    subclass = descriptor.sub_class_code(),
                    "interface is not USBTMC, continuing anyway"
                );
            }

            let mut bulk_in = None;
            let mut bulk_out = None;
            let mut interrupt_out = None;
            let mut message_in = None;
            for ep in descriptor.endpoint_descriptors() {
                let info = |kind| EndpointInfo {
                    address: ep.address(),
                    max_packet_size: usize::from(ep.max_packet_size()),
                    kind,
                };
                match (ep.transfer_type(), ep.direction()) {
                    (rusb::TransferType::Bulk, rusb::Direction::In) => {
                        bulk_in = Some(info(TransferKind::Bulk))
                    }
                    (rusb::TransferType::Bulk, rusb::Direction::Out) => {
                        bulk_out = Some(info(TransferKind::Bulk))
                    }
                    (rusb::TransferType::Interrupt, rusb::Direction::Out) => {
                        interrupt_out = Some(info(TransferKind::Interrupt))
                    }
                    (rusb::TransferType::Interrupt, rusb::Direction::In) => {
                        message_in = Some(info(TransferKind::Interrupt))
                    }
                    _ => {}
                }
            }

            let bulk_in = bulk_in.ok_or_else(|| {
                PortError::Setup(format!("Interface {} has no IN data endpoint", interface))
            })?;
            // Bulk is preferred for the write pipe when both exist
            let out = bulk_out.or(interrupt_out).ok_or_else(|| {
                PortError::Setup(format!("Interface {} has no OUT data endpoint", interface))
            })?;
            return Ok((bulk_in, out, message_in));
        }
    }

    Err(PortError::Setup(format!(
        "Device has no interface {}",
        interface
    )))
}

fn native_type(kind: TransferKind) -> u8 {
    match kind {
        TransferKind::Bulk => LIBUSB_TRANSFER_TYPE_BULK,
        TransferKind::Interrupt => LIBUSB_TRANSFER_TYPE_INTERRUPT,
    }
}

fn map_submit_rc(rc: c_int) -> Result<(), PortError> {
    match rc {
        0 => Ok(()),
        LIBUSB_ERROR_NO_DEVICE => Err(PortError::Disconnected),
        LIBUSB_ERROR_BUSY => Err(PortError::Unhandled(
            "transfer already submitted".into(),
        )),
        other => Err(PortError::Unhandled(format!(
            "libusb_submit_transfer failed: {}",
            other
        ))),
    }
}

fn map_transfer_status(status: c_int) -> HostStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => HostStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => HostStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => HostStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => HostStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => HostStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => HostStatus::Overflow,
        _ => HostStatus::Error,
    }
}

//! Class driver registry and dispatch
//!
//! On a newly configured device the registry tries each enabled class
//! driver against the device's descriptors in a fixed priority order;
//! the first driver that accepts is linked into the device's driver
//! list. Devices with class 0 get one dispatch per interface (or per
//! interface association); vendor-specific devices are offered to the
//! vendor drivers.

use log::{info, warn};

use crate::descriptor::InterfaceIter;
use crate::enumeration::{self, Device, DeviceState, DriverId};
use crate::host::UsbHost;

#[cfg(feature = "aoa")]
pub mod aoa;
#[cfg(feature = "ftdi")]
pub mod ftdi;
#[cfg(feature = "hid")]
pub mod hid;
#[cfg(feature = "hub")]
pub mod hub;
#[cfg(feature = "msd")]
pub mod msd;
#[cfg(feature = "uvc")]
pub mod uvc;

/// Capability set every class driver implements.
///
/// `load` inspects a descriptor slice — an interface slice for
/// per-interface dispatch, or the whole configuration bundle for
/// device-level dispatch — and claims a driver slot when it accepts
/// the function. `unload` releases the slot and closes its endpoints.
pub trait ClassDriver {
    /// Human-readable driver name for logs
    fn name(&self) -> &'static str;
    /// Gate on the class/subclass/protocol triple before `load`
    fn matches(&self, class: u8, subclass: u8, protocol: u8) -> bool;
    /// Try to bind to the function described by `desc`
    fn load(&mut self, host: &UsbHost, dev: &mut Device, desc: &[u8]) -> Option<DriverId>;
    /// Release the instance behind `id`
    fn unload(&mut self, host: &UsbHost, id: DriverId);
    /// One-time pool initialization at host start
    fn init(&mut self) {}
}

/// Initialize every registered driver pool; called from
/// [`UsbHost::start`].
pub(crate) fn init_drivers(host: &UsbHost) {
    #[cfg(feature = "ftdi")]
    host.ftdi.borrow_mut().init();
    #[cfg(feature = "aoa")]
    host.aoa.borrow_mut().init();
    #[cfg(feature = "uvc")]
    host.uvc.borrow_mut().init();
    #[cfg(feature = "msd")]
    host.msd.borrow_mut().init();
    #[cfg(feature = "hid")]
    host.hid.borrow_mut().init();
    #[cfg(feature = "hub")]
    host.hubs.borrow_mut().init();
    let _ = host;
}

/// Try every registered driver against one function, in priority
/// order. Returns true when a driver claimed it.
pub(crate) fn classdriver_load(
    host: &UsbHost,
    dev: &mut Device,
    class: u8,
    subclass: u8,
    protocol: u8,
    desc: &[u8],
) -> bool {
    // Priority order mirrors the registry table: vendor drivers first,
    // then video, mass storage, HID, accessory, hub last.
    macro_rules! try_driver {
        ($pool:expr) => {{
            let mut pool = $pool.borrow_mut();
            if pool.matches(class, subclass, protocol) {
                info!("usbh: try load driver {}", pool.name());
                if let Some(id) = pool.load(host, dev, desc) {
                    drop(pool);
                    if dev.drivers.push(id).is_err() {
                        warn!("usbh: device driver list full");
                        $pool.borrow_mut().unload(host, id);
                        return false;
                    }
                    return true;
                }
            }
        }};
    }

    #[cfg(feature = "ftdi")]
    try_driver!(host.ftdi);
    #[cfg(feature = "aoa")]
    try_driver!(host.aoa);
    #[cfg(feature = "uvc")]
    try_driver!(host.uvc);
    #[cfg(feature = "msd")]
    try_driver!(host.msd);
    #[cfg(feature = "hid")]
    try_driver!(host.hid);
    #[cfg(feature = "hub")]
    try_driver!(host.hubs);

    let _ = (host, dev, desc);
    false
}

/// Bind class drivers to a freshly enumerated device.
pub(crate) fn process_device(host: &UsbHost, dev: &mut Device) {
    info!("usbh: new device found");
    let Some(devdesc) = dev.dev_desc else { return };

    info!(
        "usbh: VID={:04x} PID={:04x} class={:02x}/{:02x}/{:02x} configs={}",
        devdesc.id_vendor,
        devdesc.id_product,
        devdesc.device_class,
        devdesc.device_sub_class,
        devdesc.device_protocol,
        devdesc.num_configurations
    );

    // Multi-configuration devices get configuration 0; in practice
    // commercial devices ship exactly one.
    if dev.state != DeviceState::Configured {
        warn!("usbh: multiple configurations not supported, selecting configuration 0");
        if enumeration::configure(host, dev, 0).is_err() {
            warn!("usbh: couldn't configure device, abort");
            return;
        }
    }

    if enumeration::read_full_configuration(host, dev).is_err() {
        warn!("usbh: couldn't read full configuration descriptor, abort");
        return;
    }

    // Iterate a copy of the bundle so drivers may mutate the device
    // (open endpoints, stash state) while we walk it.
    let bundle = dev.full_cfg.clone();

    if devdesc.device_class == 0 {
        // each interface (or association) declares its own function
        info!("usbh: load a driver per interface");
        let Ok((_, interfaces)) = InterfaceIter::new(&bundle) else {
            warn!("usbh: invalid configuration descriptor");
            return;
        };

        let mut last_iad_first: Option<u8> = None;
        let mut last_if: Option<u8> = None;
        for iface in interfaces {
            if let Some(iad) = iface.iad {
                if last_iad_first == Some(iad.first_interface) {
                    continue;
                }
                last_iad_first = Some(iad.first_interface);
                if !classdriver_load(
                    host,
                    dev,
                    iad.function_class,
                    iad.function_sub_class,
                    iad.function_protocol,
                    iface.raw,
                ) {
                    warn!(
                        "usbh: no drivers for interface association {}..{}",
                        iad.first_interface,
                        iad.first_interface + iad.interface_count.saturating_sub(1)
                    );
                }
            } else {
                if last_if == Some(iface.desc.interface_number) {
                    continue;
                }
                last_if = Some(iface.desc.interface_number);
                if !classdriver_load(
                    host,
                    dev,
                    iface.desc.interface_class,
                    iface.desc.interface_sub_class,
                    iface.desc.interface_protocol,
                    iface.raw,
                ) {
                    warn!(
                        "usbh: no drivers for interface {}",
                        iface.desc.interface_number
                    );
                }
            }
        }
    } else {
        // device-level class: hand the whole bundle over
        if !classdriver_load(
            host,
            dev,
            devdesc.device_class,
            devdesc.device_sub_class,
            devdesc.device_protocol,
            &bundle,
        ) {
            warn!("usbh: no drivers found");
        }
    }

    if !dev.keep_full_cfg {
        dev.full_cfg.clear();
    }
}

/// Unload every driver bound to the device, newest first.
pub(crate) fn unload_all(host: &UsbHost, dev: &mut Device) {
    while let Some(id) = dev.drivers.pop() {
        match id {
            #[cfg(feature = "msd")]
            DriverId::Msd(_) => host.msd.borrow_mut().unload(host, id),
            #[cfg(feature = "hub")]
            DriverId::Hub(_) => hub::unload_detached(host, id),
            #[cfg(feature = "hid")]
            DriverId::Hid(_) => host.hid.borrow_mut().unload(host, id),
            #[cfg(feature = "ftdi")]
            DriverId::Ftdi(_) => host.ftdi.borrow_mut().unload(host, id),
            #[cfg(feature = "aoa")]
            DriverId::Aoa(_) => host.aoa.borrow_mut().unload(host, id),
            #[cfg(feature = "uvc")]
            DriverId::Uvc(_) => host.uvc.borrow_mut().unload(host, id),
        }
    }
}

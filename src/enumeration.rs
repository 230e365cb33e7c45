//! Device object and enumeration
//!
//! Enumeration follows the standard dance: read the first 8 bytes of
//! the device descriptor through a provisional 64-byte endpoint 0,
//! re-initialize endpoint 0 with the reported max packet size, assign
//! an address from the host's bitmap, re-initialize endpoint 0 once
//! more (the address change invalidates the cached endpoint state),
//! wait out the address stabilization time, then read the full
//! descriptor. Any failure frees the address and reports the device
//! disconnected; the port layer owns the retry loop.

use heapless::Vec;
use log::{info, warn};

use crate::descriptor::{self, ConfigDescriptor, DeviceDescriptor};
use crate::error::{Result, UsbError};
use crate::host::{EpConfig, UsbHost, CONTROL_REQUEST_TIMEOUT_MS};
use crate::urb::{EpHandle, SetupPacket};

/// Capacity for a device's cached full configuration descriptor
pub const MAX_CFG_DESC: usize = 512;

/// Settling time after SET_ADDRESS before the new address is used
pub const ADDRESS_STABILIZATION_MS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    Disconnected,
    /// Raw connect seen, debounce not finished
    Attached,
    /// Connect confirmed after debounce
    Connected,
    /// Reset complete, address 0
    Default,
    /// SET_ADDRESS accepted
    Address,
    /// SET_CONFIGURATION accepted
    Configured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceSpeed {
    /// 1.5 Mbps
    Low,
    /// 12 Mbps
    Full,
    /// 480 Mbps
    High,
}

/// Identifier of a loaded class-driver instance, linking the device to
/// a slot in the host-owned driver arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverId {
    #[cfg(feature = "msd")]
    Msd(u8),
    #[cfg(feature = "hub")]
    Hub(u8),
    #[cfg(feature = "hid")]
    Hid(u8),
    #[cfg(feature = "ftdi")]
    Ftdi(u8),
    #[cfg(feature = "aoa")]
    Aoa(u8),
    #[cfg(feature = "uvc")]
    Uvc(u8),
}

/// One attached USB device (embedded in its port)
pub struct Device {
    pub state: DeviceState,
    pub speed: DeviceSpeed,
    /// Assigned address; 0 until SET_ADDRESS succeeds
    pub address: u8,
    /// Control endpoint
    pub ep0: Option<EpHandle>,
    pub dev_desc: Option<DeviceDescriptor>,
    pub cfg_desc: Option<ConfigDescriptor>,
    /// Full configuration bundle, populated during class dispatch
    pub full_cfg: Vec<u8, MAX_CFG_DESC>,
    /// A class driver may request the bundle be kept after load
    pub keep_full_cfg: bool,
    /// First language ID from string descriptor 0, or 0
    pub lang_id0: u16,
    /// Selected configuration index
    pub configuration: u8,
    /// Loaded class drivers, in load order
    pub drivers: Vec<DriverId, 4>,
}

impl Device {
    pub(crate) fn new() -> Self {
        Self {
            state: DeviceState::Disconnected,
            speed: DeviceSpeed::Full,
            address: 0,
            ep0: None,
            dev_desc: None,
            cfg_desc: None,
            full_cfg: Vec::new(),
            keep_full_cfg: false,
            lang_id0: 0,
            configuration: 0,
            drivers: Vec::new(),
        }
    }

    /// Reset per-connection state after a successful port reset
    pub(crate) fn initialize(&mut self, speed: DeviceSpeed) {
        self.state = DeviceState::Default;
        self.speed = speed;
        self.address = 0;
        self.dev_desc = None;
        self.cfg_desc = None;
        self.full_cfg.clear();
        self.keep_full_cfg = false;
        self.lang_id0 = 0;
        self.configuration = 0;
        self.drivers.clear();
    }

    pub fn is_low_speed(&self) -> bool {
        self.speed == DeviceSpeed::Low
    }
}

// ===== standard request helpers =====

pub(crate) fn get_device_descriptor(
    host: &UsbHost,
    ep0: EpHandle,
    length: u16,
    buf: &mut [u8],
) -> Result<()> {
    let req = SetupPacket::get_descriptor(descriptor::desc_type::DEVICE, 0, 0, length);
    let (status, _) = host.control_request(ep0, req, buf, CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()?;
    if buf[0] as usize != descriptor::DEVICE_DESC_SIZE || buf[1] != descriptor::desc_type::DEVICE {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(())
}

pub(crate) fn get_config_descriptor(
    host: &UsbHost,
    ep0: EpHandle,
    index: u8,
    length: u16,
    buf: &mut [u8],
) -> Result<()> {
    let req = SetupPacket::get_descriptor(descriptor::desc_type::CONFIGURATION, index, 0, length);
    let (status, _) = host.control_request(ep0, req, buf, CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()?;
    if (buf[0] as usize) < descriptor::CONFIG_DESC_SIZE
        || buf[1] != descriptor::desc_type::CONFIGURATION
    {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(())
}

pub(crate) fn get_string_descriptor(
    host: &UsbHost,
    ep0: EpHandle,
    index: u8,
    lang_id: u16,
    length: u16,
    buf: &mut [u8],
) -> Result<()> {
    debug_assert!(length as usize >= descriptor::STRING_DESC_HEADER_SIZE);
    let req = SetupPacket::get_descriptor(descriptor::desc_type::STRING, index, lang_id, length);
    let (status, _) = host.control_request(ep0, req, buf, CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()?;
    if (buf[0] as usize) < descriptor::STRING_DESC_HEADER_SIZE
        || buf[1] != descriptor::desc_type::STRING
    {
        return Err(UsbError::InvalidDescriptor);
    }
    Ok(())
}

pub fn set_interface(host: &UsbHost, ep0: EpHandle, interface: u8, alt: u8) -> Result<()> {
    host.control_nodata(
        ep0,
        SetupPacket::set_interface(interface, alt),
        CONTROL_REQUEST_TIMEOUT_MS,
    )
    .into_result()
}

pub fn get_interface(host: &UsbHost, ep0: EpHandle, interface: u8) -> Result<u8> {
    let req = SetupPacket::new(
        SetupPacket::IN_STANDARD_INTERFACE,
        SetupPacket::REQ_GET_INTERFACE,
        0,
        interface as u16,
        1,
    );
    let mut alt = [0u8; 1];
    let (status, _) = host.control_request(ep0, req, &mut alt, CONTROL_REQUEST_TIMEOUT_MS);
    status.into_result()?;
    Ok(alt[0])
}

/// Read a device string descriptor as ASCII into `dest`; returns the
/// number of bytes written. Index 0 yields an empty string.
pub fn read_string(
    host: &UsbHost,
    dev: &Device,
    index: u8,
    dest: &mut [u8],
) -> Result<usize> {
    if index == 0 || dev.lang_id0 == 0 {
        return Ok(0);
    }
    let ep0 = dev.ep0.ok_or(UsbError::InvalidState)?;
    let mut buf = [0u8; 64];
    get_string_descriptor(host, ep0, index, dev.lang_id0, buf.len() as u16, &mut buf)?;
    descriptor::extract_string(&buf, dest)
}

// ===== enumeration steps =====

fn reopen_ep0(host: &UsbHost, dev: &mut Device, mps0: u16) -> Result<()> {
    if let Some(ep0) = dev.ep0.take() {
        host.ep_close(ep0);
    }
    let ep0 = host.ep_open(EpConfig::ep0(dev.address, mps0, dev.is_low_speed()))?;
    dev.ep0 = Some(ep0);
    Ok(())
}

/// Run the enumeration protocol on a freshly reset device. On failure
/// the assigned address is released and the caller retries or abandons.
pub(crate) fn enumerate(host: &UsbHost, dev: &mut Device) -> Result<()> {
    info!("usbh: enumerate");

    let ep0 = dev.ep0.ok_or(UsbError::InvalidState)?;
    let mut buf = [0u8; descriptor::DEVICE_DESC_SIZE];

    // first 8 bytes through the provisional 64-byte endpoint
    get_device_descriptor(host, ep0, 8, &mut buf[..8])?;
    let mps0 = DeviceDescriptor::max_packet_size0_from_prefix(&buf[..8])? as u16;

    info!("usbh: ep0 max packet size = {}", mps0);
    reopen_ep0(host, dev, mps0)?;

    let addr = host
        .with(|h| h.alloc_address())
        .ok_or(UsbError::NoResources)?;

    info!("usbh: set device address: {}", addr);
    let status = host.control_nodata(
        dev.ep0.unwrap_or(ep0),
        SetupPacket::set_address(addr),
        CONTROL_REQUEST_TIMEOUT_MS,
    );
    if status.into_result().is_err() {
        warn!("usbh: SET_ADDRESS failed");
        host.with(|h| h.free_address(addr));
        return Err(UsbError::TransactionError);
    }
    dev.address = addr;

    // the address change invalidates cached endpoint state
    reopen_ep0(host, dev, mps0)?;

    crate::timing::delay_ms(ADDRESS_STABILIZATION_MS);
    dev.state = DeviceState::Address;

    // full device descriptor at the new address
    let ep0 = dev.ep0.ok_or(UsbError::InvalidState)?;
    if get_device_descriptor(host, ep0, buf.len() as u16, &mut buf).is_err() {
        warn!("usbh: full device descriptor read failed");
        host.with(|h| h.free_address(addr));
        dev.address = 0;
        return Err(UsbError::TransactionError);
    }
    dev.dev_desc = Some(DeviceDescriptor::from_bytes(&buf)?);

    info!("usbh: enumeration finished");
    Ok(())
}

/// Fetch the default language ID; missing string support is normal.
pub(crate) fn load_lang_id0(host: &UsbHost, dev: &mut Device) {
    let Some(ep0) = dev.ep0 else { return };
    let mut buf = [0u8; 4];
    if get_string_descriptor(host, ep0, 0, 0, 4, &mut buf).is_ok() {
        if let Ok(lang) = descriptor::lang_id0(&buf) {
            dev.lang_id0 = lang;
            info!("usbh: lang_id0 = {:04x}", lang);
        }
    }
}

const CONFIG_ATTEMPTS: u8 = 3;

/// Read the basic configuration descriptor and select the
/// configuration, with bounded retries on both steps.
pub(crate) fn configure(host: &UsbHost, dev: &mut Device, index: u8) -> Result<()> {
    let ep0 = dev.ep0.ok_or(UsbError::InvalidState)?;

    info!("usbh: reading basic configuration descriptor {}", index);
    let mut buf = [0u8; descriptor::CONFIG_DESC_SIZE];
    let mut cfg = None;
    for _ in 0..CONFIG_ATTEMPTS {
        if get_config_descriptor(host, ep0, index, buf.len() as u16, &mut buf).is_ok() {
            cfg = ConfigDescriptor::from_bytes(&buf).ok();
            break;
        }
    }
    let cfg = cfg.ok_or_else(|| {
        warn!("usbh: could not read configuration descriptor {}", index);
        UsbError::TransactionError
    })?;

    info!("usbh: selecting configuration {}", cfg.configuration_value);
    for _ in 0..CONFIG_ATTEMPTS {
        let status = host.control_nodata(
            ep0,
            SetupPacket::set_configuration(cfg.configuration_value),
            CONTROL_REQUEST_TIMEOUT_MS,
        );
        if status.into_result().is_ok() {
            dev.cfg_desc = Some(cfg);
            dev.configuration = index;
            dev.state = DeviceState::Configured;
            info!("usbh: device configured");
            return Ok(());
        }
    }

    Err(UsbError::TransactionError)
}

/// Read the full configuration bundle into the device's buffer, with
/// bounded retries and a fixed backoff for slow devices.
pub(crate) fn read_full_configuration(host: &UsbHost, dev: &mut Device) -> Result<()> {
    let ep0 = dev.ep0.ok_or(UsbError::InvalidState)?;
    let cfg = dev.cfg_desc.ok_or(UsbError::InvalidState)?;
    let total = cfg.total_length as usize;

    if total > MAX_CFG_DESC {
        warn!("usbh: configuration descriptor too large ({}B)", total);
        return Err(UsbError::BufferOverflow);
    }

    dev.full_cfg.clear();
    dev.full_cfg.resize(total, 0).map_err(|_| UsbError::BufferOverflow)?;

    for _ in 0..CONFIG_ATTEMPTS {
        if get_config_descriptor(
            host,
            ep0,
            dev.configuration,
            total as u16,
            &mut dev.full_cfg,
        )
        .is_ok()
        {
            return Ok(());
        }
        crate::timing::delay_ms(200);
    }

    dev.full_cfg.clear();
    Err(UsbError::TransactionError)
}

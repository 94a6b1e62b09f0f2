//! Camera discovery
//!
//! The target's renderer keeps a list of live cameras. We scan a bounded
//! prefix of it, resolve each camera's owning object, read the owner's name
//! and classify cameras by substring into the first-person ("primary") and
//! optic ("secondary") roles.

use crate::config::CameraOffsets;
use crate::memory::{address, decode_cstr, Memory};
use crate::platform::{ModuleInfo, ReadFlags};
use crate::{Error, Result};
use tracing::{debug, trace};

/// A discovered camera object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraHandle {
    /// Camera object address
    pub camera: u64,
    /// Address of its view matrix
    pub view_matrix: u64,
}

impl CameraHandle {
    fn new(camera: u64, offsets: &CameraOffsets) -> Self {
        Self {
            camera,
            view_matrix: camera.wrapping_add(offsets.view_matrix),
        }
    }

    /// Field-of-view address
    pub fn fov(&self, offsets: &CameraOffsets) -> u64 {
        self.camera.wrapping_add(offsets.fov)
    }

    /// Aspect-ratio address
    pub fn aspect(&self, offsets: &CameraOffsets) -> u64 {
        self.camera.wrapping_add(offsets.aspect)
    }
}

/// Cameras found for the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCameras {
    /// First-person camera
    pub primary: CameraHandle,
    /// Optic camera, when one exists
    pub secondary: Option<CameraHandle>,
}

/// Scan the camera list once
///
/// `Ok(None)` means the list was readable but no primary camera is in it yet,
/// which is normal right after a session starts.
pub fn discover(
    memory: &Memory,
    module: &ModuleInfo,
    offsets: &CameraOffsets,
    scan_limit: usize,
    name_length: usize,
) -> Result<Option<DiscoveredCameras>> {
    let list_slot = module.base_address.wrapping_add(offsets.camera_list);
    if !module.contains(list_slot) {
        return Err(Error::InvalidAddress(list_slot));
    }

    let list = memory.read_ptr(list_slot, ReadFlags::UNCACHED)?;
    let items = memory.read_ptr(list.wrapping_add(offsets.list_items), ReadFlags::UNCACHED)?;
    let count: i32 = memory.read_value(list.wrapping_add(offsets.list_count), ReadFlags::UNCACHED)?;
    let count = usize::try_from(count).unwrap_or(0).min(scan_limit);

    if count == 0 {
        trace!("Camera list is empty");
        return Ok(None);
    }

    let cameras: Vec<u64> = memory
        .read_span::<u64>(items, count, ReadFlags::UNCACHED)?
        .into_iter()
        .filter(|&camera| address::is_valid(camera))
        .collect();

    // camera -> owner -> name pointer -> name, one round trip per level
    let mut batch = memory.scatter(ReadFlags::UNCACHED);
    for &camera in &cameras {
        batch.prepare::<u64>(camera.wrapping_add(offsets.owner));
    }
    let results = batch.execute()?;
    let owners: Vec<(u64, u64)> = cameras
        .iter()
        .filter_map(|&camera| {
            results
                .read_ptr(camera.wrapping_add(offsets.owner))
                .map(|owner| (camera, owner))
        })
        .collect();

    let mut batch = memory.scatter(ReadFlags::UNCACHED);
    for &(_, owner) in &owners {
        batch.prepare::<u64>(owner.wrapping_add(offsets.owner_name));
    }
    let results = batch.execute()?;
    let name_pointers: Vec<(u64, u64)> = owners
        .iter()
        .filter_map(|&(camera, owner)| {
            results
                .read_ptr(owner.wrapping_add(offsets.owner_name))
                .map(|name| (camera, name))
        })
        .collect();

    let mut batch = memory.scatter(ReadFlags::UNCACHED);
    for &(_, name) in &name_pointers {
        batch.prepare_bytes(name, name_length);
    }
    let results = batch.execute()?;

    let mut primary = None;
    let mut secondary = None;

    for &(camera, name_address) in &name_pointers {
        let Some(bytes) = results.bytes(name_address, name_length) else {
            continue;
        };
        let name = decode_cstr(bytes);
        trace!(camera = format_args!("{:#x}", camera), %name, "Camera entry");

        if primary.is_none() && name.contains(offsets.primary_name.as_str()) {
            primary = Some(CameraHandle::new(camera, offsets));
        } else if secondary.is_none() && name.contains(offsets.secondary_name.as_str()) {
            secondary = Some(CameraHandle::new(camera, offsets));
        }
    }

    debug!(
        scanned = count,
        primary = primary.is_some(),
        secondary = secondary.is_some(),
        "Camera scan finished"
    );

    Ok(primary.map(|primary| DiscoveredCameras { primary, secondary }))
}

//! Output device lookup

use cpal::traits::{DeviceTrait, HostTrait};

use super::error::{AudioError, AudioResult};

/// Names of every output device on every available host
pub fn output_device_names() -> Vec<String> {
    let mut names = Vec::new();
    for host_id in cpal::available_hosts() {
        let host = match cpal::host_from_id(host_id) {
            Ok(host) => host,
            Err(e) => {
                log::debug!("Could not initialize host {:?}: {}", host_id, e);
                continue;
            }
        };
        match host.output_devices() {
            Ok(devices) => names.extend(devices.filter_map(|d| d.name().ok())),
            Err(e) => log::debug!("Could not enumerate devices for {:?}: {}", host_id, e),
        }
    }
    names
}

/// Find an output device by name across all hosts
pub fn find_device(name: &str) -> AudioResult<cpal::Device> {
    for host_id in cpal::available_hosts() {
        let Ok(host) = cpal::host_from_id(host_id) else {
            continue;
        };
        let Ok(mut devices) = host.output_devices() else {
            continue;
        };
        if let Some(device) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            return Ok(device);
        }
    }
    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Default output device of the default host
pub fn default_device() -> AudioResult<cpal::Device> {
    cpal::default_host().default_output_device().ok_or(AudioError::NoDefaultDevice)
}

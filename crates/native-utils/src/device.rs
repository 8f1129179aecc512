use anyhow::Context;
use cpal::Device;
use cpal::traits::{DeviceTrait, HostTrait};

fn get_host() -> cpal::Host {
    cpal::default_host()
}

/// Finds the input device called `device_name`, or the host's default input.
pub fn get_or_default_input(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    tracing::debug!("Host: {:?}", host.id());
    let target = match device_name {
        Some(name) => name,
        None => host
            .default_input_device()
            .context("No default input device")?
            .name()
            .context("Default input device has no name")?,
    };

    host.input_devices()
        .context("Failed to enumerate input devices")?
        .find(|d| d.name().is_ok_and(|name| name == target))
        .ok_or_else(|| anyhow::anyhow!("No input device named {:?}", target))
}

/// Finds the output device called `device_name`, or the host's default output.
pub fn get_or_default_output(device_name: Option<String>) -> anyhow::Result<Device> {
    let host = get_host();
    let target = match device_name {
        Some(name) => name,
        None => host
            .default_output_device()
            .context("No default output device")?
            .name()
            .context("Default output device has no name")?,
    };

    host.output_devices()
        .context("Failed to enumerate output devices")?
        .find(|d| d.name().is_ok_and(|name| name == target))
        .ok_or_else(|| anyhow::anyhow!("No output device named {:?}", target))
}

fn describe(name: String, channels: u16, sample_rate: u32, default: bool) -> String {
    let mut d = format!(" * {}({}ch, {}hz)", name, channels, sample_rate);
    if default {
        d.push_str(" [default]");
    }
    d
}

pub fn get_available_inputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_device = host.default_input_device().and_then(|d| d.name().ok());

    let mut device_names = Vec::new();
    for in_device in host.input_devices()? {
        let Ok(d_name) = in_device.name() else {
            continue;
        };
        let Ok(d_cfg) = in_device.default_input_config() else {
            tracing::debug!("Skipping input {} without default config", d_name);
            continue;
        };
        let is_default = default_device.as_deref() == Some(d_name.as_str());
        device_names.push(describe(d_name, d_cfg.channels(), d_cfg.sample_rate().0, is_default));
    }
    Ok(device_names.join("\n"))
}

pub fn get_available_outputs() -> anyhow::Result<String> {
    let host = get_host();
    let default_device = host.default_output_device().and_then(|d| d.name().ok());

    let mut device_names = Vec::new();
    for out_device in host.output_devices()? {
        let Ok(d_name) = out_device.name() else {
            continue;
        };
        let Ok(d_cfg) = out_device.default_output_config() else {
            tracing::debug!("Skipping output {} without default config", d_name);
            continue;
        };
        let is_default = default_device.as_deref() == Some(d_name.as_str());
        device_names.push(describe(d_name, d_cfg.channels(), d_cfg.sample_rate().0, is_default));
    }
    Ok(device_names.join("\n"))
}

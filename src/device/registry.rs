//! Device discovery and creation.
//!
//! A registry is an ordinary value: construct it from a [`RegistryConfig`],
//! pass it where devices are needed, [`clear`](DeviceRegistry::clear) it to
//! re-run discovery. Which backends exist is decided by Cargo features.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::util::{Error, Result};
use super::cpu::CpuDevice;
use super::kernel::Kernel;
use super::multi::MultiDevice;
use super::{Device, DeviceInfo, DeviceType};

/// What the registry reports as available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// CPU worker threads, 0 = all cores.
    pub cpu_threads: usize,
    /// Number of accelerator devices to expose.
    pub accelerators: usize,
    /// Memory budget per accelerator in bytes.
    pub accelerator_memory: usize,
    /// `host:port` of render servers.
    pub network_servers: Vec<String>,
    /// Dedicate the last accelerator to denoising when there are several.
    pub dedicated_denoiser: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cpu_threads: 0,
            accelerators: 0,
            accelerator_memory: 1 << 30,
            network_servers: Vec::new(),
            dedicated_denoiser: false,
        }
    }
}

impl RegistryConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accelerators > 0 && self.accelerator_memory == 0 {
            return Err(Error::invalid("accelerator_memory must be non-zero"));
        }
        if let Some(bad) = self.network_servers.iter().find(|s| !s.contains(':')) {
            return Err(Error::invalid(format!("network server '{bad}' is not host:port")));
        }
        Ok(())
    }
}

pub struct DeviceRegistry {
    config: RegistryConfig,
    devices: Mutex<Option<Vec<DeviceInfo>>>,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { config, devices: Mutex::new(None) }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Backend types compiled into this build.
    pub fn available_types(&self) -> Vec<DeviceType> {
        let mut types = vec![DeviceType::Cpu];
        if cfg!(feature = "accelerator") {
            types.push(DeviceType::Accelerator);
        }
        if cfg!(feature = "network") {
            types.push(DeviceType::Network);
        }
        types.push(DeviceType::Multi);
        types
    }

    pub fn type_from_name(name: &str) -> Option<DeviceType> {
        match name.to_ascii_uppercase().as_str() {
            "CPU" => Some(DeviceType::Cpu),
            "ACCELERATOR" | "ACCEL" | "GPU" => Some(DeviceType::Accelerator),
            "NETWORK" => Some(DeviceType::Network),
            "MULTI" => Some(DeviceType::Multi),
            _ => None,
        }
    }

    /// Devices matching `mask` (all when `None`). Discovery runs once and
    /// is cached until [`clear`](Self::clear).
    pub fn available_devices(&self, mask: Option<DeviceType>) -> Vec<DeviceInfo> {
        let mut cache = self.devices.lock();
        let devices = cache.get_or_insert_with(|| self.discover());
        devices
            .iter()
            .filter(|d| mask.map_or(true, |m| d.device_type == m))
            .cloned()
            .collect()
    }

    fn discover(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        #[cfg(feature = "accelerator")]
        for num in 0..self.config.accelerators {
            let mut info = super::accelerator::AcceleratorDevice::device_info(num);
            info.memory_limit = Some(self.config.accelerator_memory);
            devices.push(info);
        }

        #[cfg(feature = "network")]
        for (num, address) in self.config.network_servers.iter().enumerate() {
            devices.push(DeviceInfo {
                device_type: DeviceType::Network,
                description: format!("Network {address}"),
                id: format!("NETWORK_{address}"),
                num,
                address: Some(address.clone()),
                ..Default::default()
            });
        }

        let threads = match self.config.cpu_threads {
            0 => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            n => n,
        };
        let mut cpu = DeviceInfo::cpu(threads);
        cpu.description = format!("CPU ({threads} threads)");
        devices.push(cpu);

        tracing::debug!(count = devices.len(), "device discovery");
        devices
    }

    /// Forget discovered devices.
    pub fn clear(&self) {
        *self.devices.lock() = None;
    }

    /// Describe one logical device over `subdevices`. CPU entries get
    /// `threads` workers; in background mode with a dedicated denoiser the
    /// last accelerator moves to the denoising pool.
    pub fn get_multi_device(&self, subdevices: &[DeviceInfo], threads: usize, background: bool) -> DeviceInfo {
        let mut render: Vec<DeviceInfo> = subdevices
            .iter()
            .cloned()
            .map(|mut d| {
                if d.device_type == DeviceType::Cpu && threads != 0 {
                    d.cpu_threads = threads;
                }
                d
            })
            .collect();

        let mut denoising = Vec::new();
        let accelerators = render.iter().filter(|d| d.device_type == DeviceType::Accelerator).count();
        if background && self.config.dedicated_denoiser && accelerators > 1 {
            if let Some(pos) = render.iter().rposition(|d| d.device_type == DeviceType::Accelerator) {
                denoising.push(render.remove(pos));
            }
        }
        DeviceInfo::multi(render, denoising)
    }

    /// Instantiate `info`. `None` when the backend is not compiled in or
    /// cannot be reached; the reason is logged.
    pub fn create(&self, info: &DeviceInfo, kernel: Arc<dyn Kernel>) -> Option<Arc<dyn Device>> {
        match info.device_type {
            DeviceType::Cpu => Some(CpuDevice::new(info.clone(), kernel)),
            DeviceType::Accelerator => create_accelerator(info, kernel),
            DeviceType::Network => create_network(info),
            DeviceType::Multi => {
                let devices = info
                    .multi_devices
                    .iter()
                    .map(|sub| self.create(sub, Arc::clone(&kernel)))
                    .collect::<Option<Vec<_>>>()?;
                let denoising = info
                    .denoising_devices
                    .iter()
                    .map(|sub| self.create(sub, Arc::clone(&kernel)))
                    .collect::<Option<Vec<_>>>()?;
                if devices.is_empty() {
                    tracing::warn!("multi device without render devices");
                    return None;
                }
                Some(MultiDevice::new(devices, denoising))
            }
        }
    }
}

#[cfg(feature = "accelerator")]
fn create_accelerator(info: &DeviceInfo, kernel: Arc<dyn Kernel>) -> Option<Arc<dyn Device>> {
    Some(super::accelerator::AcceleratorDevice::new(info.clone(), kernel))
}

#[cfg(not(feature = "accelerator"))]
fn create_accelerator(info: &DeviceInfo, _kernel: Arc<dyn Kernel>) -> Option<Arc<dyn Device>> {
    tracing::warn!(id = %info.id, "{}", Error::DeviceUnavailable("accelerator support not compiled in".into()));
    None
}

#[cfg(feature = "network")]
fn create_network(info: &DeviceInfo) -> Option<Arc<dyn Device>> {
    let Some(address) = info.address.as_deref() else {
        tracing::warn!(id = %info.id, "network device without address");
        return None;
    };
    match super::network::NetworkDevice::connect(address) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!(address, "{e}");
            None
        }
    }
}

#[cfg(not(feature = "network"))]
fn create_network(info: &DeviceInfo) -> Option<Arc<dyn Device>> {
    tracing::warn!(id = %info.id, "{}", Error::DeviceUnavailable("network support not compiled in".into()));
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConstantKernel;

    fn kernel() -> Arc<dyn Kernel> {
        Arc::new(ConstantKernel::new([1.0; 4]))
    }

    #[test]
    fn test_cpu_always_available() {
        let registry = DeviceRegistry::new(RegistryConfig { cpu_threads: 2, ..Default::default() });
        let cpus = registry.available_devices(Some(DeviceType::Cpu));
        assert_eq!(cpus.len(), 1);
        assert_eq!(cpus[0].cpu_threads, 2);
        let device = registry.create(&cpus[0], kernel()).unwrap();
        assert_eq!(device.info().device_type, DeviceType::Cpu);
    }

    #[test]
    fn test_clear_rediscovers() {
        let registry = DeviceRegistry::new(RegistryConfig::default());
        let first = registry.available_devices(None);
        registry.clear();
        assert_eq!(registry.available_devices(None), first);
    }

    #[cfg(feature = "accelerator")]
    #[test]
    fn test_multi_device() {
        let registry = DeviceRegistry::new(RegistryConfig {
            cpu_threads: 1,
            accelerators: 1,
            accelerator_memory: 1 << 20,
            ..Default::default()
        });
        let all = registry.available_devices(None);
        assert_eq!(all.len(), 2);
        let info = registry.get_multi_device(&all, 1, false);
        assert_eq!(info.device_type, DeviceType::Multi);
        let device = registry.create(&info, kernel()).unwrap();
        assert_eq!(device.num_logical_devices(), 2);
    }

    #[test]
    fn test_dedicated_denoiser() {
        let registry = DeviceRegistry::new(RegistryConfig { dedicated_denoiser: true, ..Default::default() });
        let mut a = DeviceInfo::cpu(1);
        a.device_type = DeviceType::Accelerator;
        a.id = "ACCEL_0".into();
        let mut b = a.clone();
        b.id = "ACCEL_1".into();
        let info = registry.get_multi_device(&[a.clone(), b.clone(), DeviceInfo::cpu(1)], 4, true);
        assert_eq!(info.denoising_devices, vec![b]);
        assert_eq!(info.multi_devices.len(), 2);
        assert_eq!(info.multi_devices[1].cpu_threads, 4);

        let interactive = registry.get_multi_device(&[a, DeviceInfo::cpu(1)], 0, false);
        assert!(interactive.denoising_devices.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let bad = RegistryConfig { network_servers: vec!["localhost".into()], ..Default::default() };
        assert!(bad.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, r#"{ "cpu_threads": 3 }"#).unwrap();
        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.cpu_threads, 3);
        assert_eq!(config.accelerator_memory, 1 << 30);

        assert!(matches!(RegistryConfig::load(dir.path().join("missing.json")), Err(Error::ConfigNotFound(_))));
    }
}

//! Remote devices over TCP.
//!
//! A [`DeviceServer`] wraps one local device; a [`NetworkDevice`] implements
//! [`Device`](super::Device) by forwarding every call to it. Pointers the
//! client hands out are keys the server maps to its own allocations.

mod client;
pub mod protocol;
mod server;

pub use client::NetworkDevice;
pub use server::DeviceServer;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::device::{CpuDevice, Device, DeviceMemory, DeviceTask, DeviceTaskType, DeviceType};

    fn pair(threads: usize) -> (Arc<NetworkDevice>, thread::JoinHandle<()>) {
        let server = DeviceServer::bind("127.0.0.1:0", CpuDevice::with_threads(threads)).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || server.serve_one().unwrap());
        let client = NetworkDevice::connect(&addr.to_string()).unwrap();
        (client, handle)
    }

    #[test]
    fn test_memory_round_trip() {
        let (client, server) = pair(1);
        assert_eq!(client.info().device_type, DeviceType::Network);

        let mut mem = DeviceMemory::floats("data", 1);
        mem.copy_from_slice(&(0..64).map(|i| i as f32).collect::<Vec<_>>());
        client.mem_copy_to(&mut mem);
        assert!(mem.is_allocated());
        assert_eq!(client.stats().mem_used(), 256);

        mem.zero_host();
        client.mem_copy_from(&mut mem, 0, 64, 1, 4);
        assert_eq!(mem.host::<f32>()[63], 63.0);

        client.mem_zero(&mut mem);
        client.mem_copy_from(&mut mem, 0, 64, 1, 4);
        assert!(mem.host::<f32>().iter().all(|&v| v == 0.0));

        client.mem_free(&mut mem);
        client.mem_free(&mut mem);
        assert_eq!(client.stats().mem_used(), 0);
        assert!(!client.have_error());

        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_remote_direct_task() {
        let (client, server) = pair(2);
        let mut mem = DeviceMemory::floats("buffer", 4);
        mem.resize(8 * 4, 0);
        client.mem_alloc(&mut mem);

        let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, 8, 4);
        task.stride = 8;
        task.num_samples = 3;
        task.buffer = mem.device_pointer;
        client.task_add(task);
        client.task_wait();

        client.mem_copy_from(&mut mem, 0, 8, 4, 16);
        assert!(mem.host::<f32>().iter().all(|&v| v == 3.0));

        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_unallocated_copy_from_zero_fills() {
        let (client, server) = pair(1);
        let mut mem = DeviceMemory::floats("m", 1);
        mem.resize(4, 0);
        mem.host_mut::<f32>().fill(5.0);
        client.mem_copy_from(&mut mem, 0, 4, 1, 4);
        assert!(mem.host::<f32>().iter().all(|&v| v == 0.0));
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = NetworkDevice::connect(&addr.to_string()).err().unwrap();
        assert!(matches!(err, crate::util::Error::Network(_)));
    }
}

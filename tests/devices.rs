//! Device backends exercised through the public API.

use std::sync::Arc;

use render_session::buffers::{BufferParams, FilmConstants, PassType, RenderBuffers};
use render_session::device::{
    AcceleratorDevice, ConstantKernel, CpuDevice, Device, DeviceInfo, DeviceMemory, DeviceRegistry, DeviceTask,
    DeviceTaskType, DeviceType, MultiDevice, RegistryConfig, SplitMode,
};

fn accelerator(memory: usize) -> Arc<dyn Device> {
    let info = DeviceInfo { memory_limit: Some(memory), ..AcceleratorDevice::device_info(0) };
    AcceleratorDevice::new(info, Arc::new(ConstantKernel::new([1.0; 4])))
}

fn path_trace(device: &dyn Device, buffers: &RenderBuffers, samples: u32, split_mode: SplitMode) {
    let p = &buffers.params;
    let mut task = DeviceTask::new(DeviceTaskType::PathTrace).with_region(0, 0, p.width, p.height);
    (task.offset, task.stride) = p.get_offset_stride();
    task.num_samples = samples;
    task.pass_stride = p.get_passes_size();
    task.buffer = buffers.buffer.device_pointer;
    task.rng_state = buffers.rng_state.device_pointer;
    task.split_mode = split_mode;
    device.task_add(task);
    device.task_wait();
}

#[test]
fn test_buffers_accumulate_four_samples() {
    let device: Arc<dyn Device> = CpuDevice::with_threads(4);
    let params = BufferParams::new(64, 64);
    device.const_copy_to(FilmConstants::NAME, bytemuck::bytes_of(&params.film_constants(1.0)));
    let mut buffers = RenderBuffers::with_params(device.clone(), &params);
    path_trace(device.as_ref(), &buffers, 4, SplitMode::Area);

    assert!(buffers.copy_from_device());
    let mut rect = vec![0.0; 64 * 64 * 4];
    assert!(buffers.get_pass_rect(PassType::Combined, 1.0, 4, 4, &mut rect));
    assert!(rect.iter().all(|&v| v == 1.0));
}

#[test]
fn test_split_modes_agree() {
    let device: Arc<dyn Device> = CpuDevice::with_threads(3);
    let params = BufferParams::new(37, 23);
    device.const_copy_to(FilmConstants::NAME, bytemuck::bytes_of(&params.film_constants(1.0)));
    let offset = params.pass_offset(PassType::Combined).unwrap();

    for mode in [SplitMode::Area, SplitMode::Samples] {
        let mut buffers = RenderBuffers::with_params(device.clone(), &params);
        path_trace(device.as_ref(), &buffers, 5, mode);
        buffers.copy_from_device();
        let stride = params.get_passes_size();
        for px in buffers.buffer.host::<f32>().chunks_exact(stride) {
            assert_eq!(&px[offset..offset + 4], &[5.0; 4], "{mode:?}");
        }
    }
}

#[test]
fn test_multi_allocates_everywhere_and_frees_once() {
    let cpu: Arc<dyn Device> = CpuDevice::with_threads(2);
    let accel = accelerator(1 << 20);
    let multi = MultiDevice::new(vec![cpu.clone(), accel.clone()], vec![]);

    let mut mem = DeviceMemory::floats("data", 1);
    mem.resize(1024, 0);
    multi.mem_alloc(&mut mem);
    assert!(mem.is_allocated());
    assert_eq!(multi.stats().mem_used(), 4096);
    assert!(cpu.stats().mem_used() >= 4096);
    assert!(accel.stats().mem_used() >= 4096);

    multi.mem_free(&mut mem);
    assert!(!mem.is_allocated());
    multi.mem_free(&mut mem);
    assert_eq!(multi.stats().mem_used(), 0);
    assert_eq!(cpu.stats().mem_used(), 0);
    assert_eq!(accel.stats().mem_used(), 0);
    assert!(!multi.have_error());
}

#[test]
fn test_out_of_memory_is_reported_once() {
    let accel = accelerator(4096);
    let multi = MultiDevice::new(vec![accel.clone()], vec![]);

    let mut small = DeviceMemory::floats("small", 1);
    small.resize(512, 0);
    multi.mem_alloc(&mut small);
    assert!(small.is_allocated());

    let mut big = DeviceMemory::floats("big", 1);
    big.resize(2048, 0);
    multi.mem_alloc(&mut big);
    assert!(!big.is_allocated());
    let first = multi.error_message();
    assert!(first.contains("Out of memory"), "{first}");

    // Later failures do not replace the first message.
    accel.set_error("something else");
    let mut more = DeviceMemory::floats("more", 1);
    more.resize(8, 0);
    multi.mem_alloc(&mut more);
    assert!(!more.is_allocated());
    assert_eq!(multi.error_message(), first);

    // Freeing after an error still releases memory.
    multi.mem_free(&mut small);
    assert_eq!(accel.stats().mem_used(), 0);
}

#[test]
fn test_registry_builds_multi_with_denoiser() {
    let registry = DeviceRegistry::new(RegistryConfig {
        cpu_threads: 2,
        accelerators: 2,
        accelerator_memory: 1 << 22,
        dedicated_denoiser: true,
        ..Default::default()
    });
    let all = registry.available_devices(None);
    assert!(all.iter().any(|d| d.device_type == DeviceType::Cpu));
    assert_eq!(all.iter().filter(|d| d.device_type == DeviceType::Accelerator).count(), 2);

    let info = registry.get_multi_device(&all, 0, true);
    assert_eq!(info.device_type, DeviceType::Multi);
    assert_eq!(info.denoising_devices.len(), 1);

    let device = registry.create(&info, Arc::new(ConstantKernel::new([1.0; 4]))).unwrap();
    assert_eq!(device.num_logical_devices(), 2);
    assert!(device.info().display_device);
}

#[cfg(feature = "network")]
#[test]
fn test_network_direct_render() {
    use render_session::device::{DeviceServer, NetworkDevice};

    let server = DeviceServer::bind("127.0.0.1:0", CpuDevice::with_threads(2)).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = std::thread::spawn(move || server.serve_one().unwrap());
    let client: Arc<dyn Device> = NetworkDevice::connect(&addr.to_string()).unwrap();

    let params = BufferParams::new(16, 8);
    client.const_copy_to(FilmConstants::NAME, bytemuck::bytes_of(&params.film_constants(1.0)));
    let mut buffers = RenderBuffers::with_params(client.clone(), &params);
    path_trace(client.as_ref(), &buffers, 3, SplitMode::Area);
    assert!(buffers.copy_from_device());

    let mut rect = vec![0.0; 16 * 8 * 4];
    assert!(buffers.get_pass_rect(PassType::Combined, 1.0, 3, 4, &mut rect));
    assert!(rect.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    assert!(!client.have_error());

    drop(buffers);
    assert_eq!(client.stats().mem_used(), 0);
    drop(client);
    handle.join().unwrap();
}

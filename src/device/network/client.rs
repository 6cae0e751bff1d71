//! Client side of a remote device.
//!
//! Memory operations are synchronous round trips. Tasks go to a dispatch
//! thread; tile tasks are acquired locally and shipped one tile at a time,
//! so cancellation takes effect at tile granularity.

use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::device::kernel::RequestedFeatures;
use crate::device::memory::{row_span, DeviceMemory, DevicePtr, Extension, Interpolation};
use crate::device::task::DeviceTask;
use crate::device::{Device, DeviceId, DeviceInfo, DeviceType, ErrorState};
use crate::tile::{RenderTile, RenderTileNeighbors, RenderTileTask};
use crate::util::{Error, Result, Stats};
use super::protocol::{
    read_frame, write_frame, MemDesc, Request, Response, WireNeighbors, WireTask, WireTile, PROTOCOL_VERSION,
};

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn call(&mut self, request: &Request, payload: &[u8]) -> Result<(Response, Vec<u8>)> {
        write_frame(&mut self.writer, request, payload)?;
        read_frame(&mut self.reader)?.ok_or_else(|| Error::Network("server closed the connection".into()))
    }
}

enum DispatchCommand {
    Run(DeviceTask),
    Stop,
}

pub struct NetworkDevice {
    id: DeviceId,
    info: DeviceInfo,
    stats: Stats,
    error: ErrorState,
    conn: Mutex<Option<Connection>>,
    next_key: AtomicU64,
    tx: Mutex<Option<Sender<DispatchCommand>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<usize>,
    idle: Condvar,
    cancelled: AtomicBool,
}

impl NetworkDevice {
    /// Connect to a [`DeviceServer`](super::DeviceServer) at `address`.
    pub fn connect(address: &str) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(address).map_err(|e| Error::Network(format!("{address}: {e}")))?;
        stream.set_nodelay(true)?;
        let mut conn = Connection {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        };

        let remote = match conn.call(&Request::Hello { version: PROTOCOL_VERSION }, &[])? {
            (Response::Hello { info, .. }, _) => info,
            (Response::Error { message }, _) => return Err(Error::protocol(message)),
            (other, _) => return Err(Error::protocol(format!("unexpected handshake reply {other:?}"))),
        };

        let id = DeviceId::next();
        let info = DeviceInfo {
            device_type: DeviceType::Network,
            description: format!("{} on {address}", remote.description),
            id: format!("NETWORK_{address}"),
            address: Some(address.to_string()),
            memory_limit: remote.memory_limit,
            cpu_threads: remote.cpu_threads,
            ..Default::default()
        };
        let (tx, rx) = channel();

        let device = Arc::new_cyclic(|this: &Weak<NetworkDevice>| {
            let this = this.clone();
            let handle = thread::Builder::new()
                .name(format!("network-dispatch-{address}"))
                .spawn(move || dispatch_loop(this, rx));
            let error = ErrorState::default();
            let handle = match handle {
                Ok(handle) => Some(handle),
                Err(e) => {
                    error.set(&Error::DeviceUnavailable(e.to_string()).to_string());
                    None
                }
            };
            Self {
                id,
                info,
                stats: Stats::new(),
                error,
                conn: Mutex::new(Some(conn)),
                next_key: AtomicU64::new((id.get() << 40) + 1),
                tx: Mutex::new(Some(tx)),
                dispatch: Mutex::new(handle),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                cancelled: AtomicBool::new(false),
            }
        });
        tracing::info!(device = %device.id, address, remote = %remote.description, "connected to render server");
        Ok(device)
    }

    /// One round trip. Transport failures close the connection; both they
    /// and server-side errors become the sticky device error.
    fn call(&self, request: &Request, payload: &[u8]) -> Option<(Response, Vec<u8>)> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut()?;
        match conn.call(request, payload) {
            Ok((Response::Error { message }, _)) => {
                self.error.set(&message);
                None
            }
            Ok(reply) => Some(reply),
            Err(e) => {
                *guard = None;
                self.error.set(&Error::Network(e.to_string()).to_string());
                None
            }
        }
    }

    fn next_key(&self) -> DevicePtr {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn finish_one(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn canceled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn record_alloc(&self, mem: &mut DeviceMemory, key: DevicePtr) {
        if mem.is_allocated() {
            self.stats.mem_free(mem.device_size);
        }
        let size = mem.memory_size();
        self.stats.mem_alloc(size);
        mem.device_pointer = key;
        mem.device_size = size;
    }

    fn run(self: &Arc<Self>, task: &DeviceTask) {
        if task.uses_tiles() {
            self.run_tiles(task);
        } else {
            self.call(&Request::RunTask { task: WireTask::of(task) }, &[]);
        }
    }

    fn run_tiles(self: &Arc<Self>, task: &DeviceTask) {
        let Some(source) = &task.tile_source else { return };
        let device: Arc<dyn Device> = self.clone();
        let mut tile = RenderTile::default();

        while source.acquire_tile(&device, &mut tile, task.tile_types) {
            let denoise = tile.task == RenderTileTask::Denoise;
            let mut neighbors = denoise.then(|| {
                let mut neighbors = RenderTileNeighbors::new(tile.clone());
                source.map_neighbor_tiles(&mut neighbors, &device);
                neighbors
            });

            let request = Request::RunTile {
                tile: WireTile::of(&tile),
                neighbors: neighbors.as_ref().map(WireNeighbors::of),
                tile_types: task.tile_types,
                film: task.film,
                denoise: task.denoise,
                must_finish: task.must_finish,
            };
            let reply = self.call(&request, &[]);

            if let Some(neighbors) = neighbors.as_mut() {
                source.unmap_neighbor_tiles(neighbors, &device);
            }
            let ok = match reply {
                Some((Response::TileDone { tile: done, pixel_samples }, _)) => {
                    tile.sample = done.sample;
                    source.update_progress(Some(&tile), if denoise { 0 } else { pixel_samples });
                    true
                }
                _ => false,
            };
            source.release_tile(&device, &mut tile);

            if !ok || self.canceled() || (source.get_cancel() && !task.must_finish) {
                break;
            }
        }
    }
}

fn dispatch_loop(device: Weak<NetworkDevice>, rx: Receiver<DispatchCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DispatchCommand::Run(task) => {
                let Some(device) = device.upgrade() else { break };
                if !device.canceled() && !device.error.is_set() {
                    device.run(&task);
                }
                device.finish_one();
            }
            DispatchCommand::Stop => break,
        }
    }
}

impl Device for NetworkDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }

    fn error_message(&self) -> String {
        self.error.message()
    }

    fn set_error(&self, msg: &str) {
        self.error.set(msg);
    }

    fn load_kernels(&self, features: &RequestedFeatures) -> bool {
        if self.error.is_set() {
            return false;
        }
        self.call(&Request::LoadKernels { features: features.clone() }, &[]).is_some()
    }

    fn mem_alloc(&self, mem: &mut DeviceMemory) {
        if self.error.is_set() {
            return;
        }
        let key = if mem.is_allocated() { mem.device_pointer } else { self.next_key() };
        if self.call(&Request::MemAlloc { key, desc: MemDesc::of(mem) }, &[]).is_some() {
            self.record_alloc(mem, key);
        }
    }

    fn mem_copy_to(&self, mem: &mut DeviceMemory) {
        if self.error.is_set() {
            return;
        }
        if !mem.is_allocated() || mem.device_size != mem.memory_size() {
            self.mem_alloc(mem);
        }
        if !mem.is_allocated() {
            return;
        }
        let request = Request::MemCopyTo { key: mem.device_pointer, desc: MemDesc::of(mem) };
        self.call(&request, mem.host_bytes());
    }

    fn mem_copy_from(&self, mem: &mut DeviceMemory, y: usize, w: usize, h: usize, elem: usize) {
        let (offset, size) = row_span(y, w, h, elem, mem.memory_size());
        if !mem.is_allocated() {
            mem.host_bytes_mut()[offset..offset + size].fill(0);
            return;
        }
        if self.error.is_set() {
            return;
        }
        let request = Request::MemCopyFrom { key: mem.device_pointer, y, w, h, elem };
        if let Some((Response::Data { offset }, data)) = self.call(&request, &[]) {
            let host = mem.host_bytes_mut();
            let end = (offset + data.len()).min(host.len());
            if offset < end {
                host[offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
    }

    fn mem_zero(&self, mem: &mut DeviceMemory) {
        mem.zero_host();
        if self.error.is_set() || !mem.is_allocated() {
            return;
        }
        self.call(&Request::MemZero { key: mem.device_pointer }, &[]);
    }

    fn mem_free(&self, mem: &mut DeviceMemory) {
        if !mem.is_allocated() {
            return;
        }
        // Released remotely even after an error; a dead connection frees
        // everything on the server anyway.
        if let Some(conn) = self.conn.lock().as_mut() {
            if let Err(e) = conn.call(&Request::MemFree { key: mem.device_pointer }, &[]) {
                tracing::debug!(device = %self.id, "mem_free: {e}");
            }
        }
        self.stats.mem_free(mem.device_size);
        mem.device_pointer = 0;
        mem.device_size = 0;
    }

    fn const_copy_to(&self, name: &str, data: &[u8]) {
        if self.error.is_set() {
            return;
        }
        self.call(&Request::ConstCopyTo { name: name.to_string() }, data);
    }

    fn tex_alloc(&self, name: &str, mem: &mut DeviceMemory, interpolation: Interpolation, extension: Extension) {
        if self.error.is_set() {
            return;
        }
        let key = if mem.is_allocated() { mem.device_pointer } else { self.next_key() };
        let request = Request::TexAlloc {
            key,
            desc: MemDesc::of(mem),
            name: name.to_string(),
            interpolation,
            extension,
        };
        if self.call(&request, mem.host_bytes()).is_some() {
            self.record_alloc(mem, key);
        }
    }

    fn task_add(&self, task: DeviceTask) {
        if self.error.is_set() {
            return;
        }
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else { return };
        *self.pending.lock() += 1;
        if tx.send(DispatchCommand::Run(task)).is_err() {
            self.finish_one();
            self.error.set("Network dispatch thread has exited");
        }
    }

    fn task_wait(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.idle.wait(&mut pending);
        }
    }

    fn task_cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task_wait();
        self.cancelled.store(false, Ordering::Release);
    }
}

impl Drop for NetworkDevice {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(DispatchCommand::Stop);
        }
        if let Some(handle) = self.dispatch.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        if let Some(mut conn) = self.conn.lock().take() {
            let _ = conn.call(&Request::Goodbye, &[]);
        }
    }
}


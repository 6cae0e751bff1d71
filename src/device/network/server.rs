//! Render server: exposes one local device to [`NetworkDevice`](super::NetworkDevice) clients.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::device::memory::{row_span, DeviceMemory, DevicePtr};
use crate::device::task::{DeviceTask, DeviceTaskType, TileSource, TileTypes};
use crate::device::Device;
use crate::tile::{RenderTile, RenderTileNeighbors, RenderTileTask};
use crate::util::{Error, Result};
use super::protocol::{read_frame, write_frame, MemDesc, Request, Response, WireNeighbors, WireTile, PROTOCOL_VERSION};

pub struct DeviceServer {
    listener: TcpListener,
    device: Arc<dyn Device>,
}

impl DeviceServer {
    pub fn bind(addr: impl ToSocketAddrs, device: Arc<dyn Device>) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| Error::Network(format!("bind: {e}")))?;
        tracing::info!(addr = ?listener.local_addr().ok(), device = %device.info().description, "render server listening");
        Ok(Self { listener, device })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one client and serve it until it says goodbye or disconnects.
    pub fn serve_one(&self) -> Result<()> {
        let (stream, peer) = self.listener.accept()?;
        serve_connection(Arc::clone(&self.device), stream, peer)
    }

    /// Serve clients forever, one thread each.
    pub fn serve(&self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            let device = Arc::clone(&self.device);
            thread::Builder::new()
                .name(format!("render-server-{peer}"))
                .spawn(move || {
                    if let Err(e) = serve_connection(device, stream, peer) {
                        tracing::warn!(%peer, "connection ended: {e}");
                    }
                })?;
        }
    }
}

fn serve_connection(device: Arc<dyn Device>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    tracing::info!(%peer, "client connected");
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut session = ClientSession { device, memory: HashMap::new() };

    while let Some((request, payload)) = read_frame::<_, Request>(&mut reader)? {
        let goodbye = matches!(request, Request::Goodbye);
        let (response, data) = session.dispatch(request, payload);
        write_frame(&mut writer, &response, &data)?;
        if goodbye {
            break;
        }
    }
    tracing::info!(%peer, "client disconnected");
    Ok(())
}

/// Per-connection state: the client's keys mapped to local memory.
struct ClientSession {
    device: Arc<dyn Device>,
    memory: HashMap<DevicePtr, DeviceMemory>,
}

impl ClientSession {
    fn status(&self) -> Response {
        if self.device.have_error() {
            Response::Error { message: self.device.error_message() }
        } else {
            Response::Ok
        }
    }

    fn local(&self, key: DevicePtr) -> DevicePtr {
        if key == 0 {
            return 0;
        }
        self.memory.get(&key).map_or(0, |m| m.device_pointer)
    }

    /// Descriptor for `key`, created or reshaped to `desc`.
    fn entry(&mut self, key: DevicePtr, desc: &MemDesc) -> &mut DeviceMemory {
        let mem = self.memory.entry(key).or_insert_with(|| desc.build());
        if mem.data_width != desc.width || mem.data_height != desc.height {
            mem.resize(desc.width, desc.height);
        }
        mem
    }

    fn fill(mem: &mut DeviceMemory, payload: &[u8]) {
        let host = mem.host_bytes_mut();
        let n = host.len().min(payload.len());
        host[..n].copy_from_slice(&payload[..n]);
    }

    #[tracing::instrument(level = "trace", skip_all)]
    fn dispatch(&mut self, request: Request, payload: Vec<u8>) -> (Response, Vec<u8>) {
        let device = Arc::clone(&self.device);
        let response = match request {
            Request::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    Response::Error { message: format!("protocol version {version}, server speaks {PROTOCOL_VERSION}") }
                } else {
                    Response::Hello { version, info: device.info().clone() }
                }
            }
            Request::LoadKernels { features } => {
                device.load_kernels(&features);
                self.status()
            }
            Request::MemAlloc { key, desc } => {
                device.mem_alloc(self.entry(key, &desc));
                self.status()
            }
            Request::MemCopyTo { key, desc } => {
                let mem = self.entry(key, &desc);
                Self::fill(mem, &payload);
                device.mem_copy_to(mem);
                self.status()
            }
            Request::MemCopyFrom { key, y, w, h, elem } => {
                let Some(mem) = self.memory.get_mut(&key) else {
                    return (Response::Error { message: format!("unknown memory {key:#x}") }, Vec::new());
                };
                device.mem_copy_from(mem, y, w, h, elem);
                let (offset, size) = row_span(y, w, h, elem, mem.memory_size());
                let data = mem.host_bytes()[offset..offset + size].to_vec();
                return (Response::Data { offset }, data);
            }
            Request::MemZero { key } => {
                if let Some(mem) = self.memory.get_mut(&key) {
                    device.mem_zero(mem);
                }
                self.status()
            }
            Request::MemFree { key } => {
                if let Some(mut mem) = self.memory.remove(&key) {
                    device.mem_free(&mut mem);
                }
                Response::Ok
            }
            Request::ConstCopyTo { name } => {
                device.const_copy_to(&name, &payload);
                self.status()
            }
            Request::TexAlloc { key, desc, name, interpolation, extension } => {
                let mem = self.entry(key, &desc);
                Self::fill(mem, &payload);
                device.tex_alloc(&name, mem, interpolation, extension);
                self.status()
            }
            Request::RunTask { task } => {
                let mut task = task.to_task();
                for ptr in [
                    &mut task.buffer,
                    &mut task.rng_state,
                    &mut task.rgba_byte,
                    &mut task.rgba_half,
                    &mut task.shader_input,
                    &mut task.shader_output,
                ] {
                    *ptr = self.local(*ptr);
                }
                device.task_add(task);
                device.task_wait();
                self.status()
            }
            Request::RunTile { tile, neighbors, tile_types, film, denoise, must_finish } => {
                return self.run_tile(tile, neighbors, tile_types, film, denoise, must_finish);
            }
            Request::ErrorMessage => Response::ErrorMessage { message: device.error_message() },
            Request::Goodbye => Response::Ok,
        };
        (response, Vec::new())
    }

    fn local_tile(&self, wire: &WireTile) -> RenderTile {
        let mut tile = wire.to_tile();
        tile.buffer = self.local(tile.buffer);
        tile.rng_state = self.local(tile.rng_state);
        tile
    }

    fn run_tile(
        &mut self,
        wire: WireTile,
        neighbors: Option<WireNeighbors>,
        tile_types: TileTypes,
        film: crate::buffers::FilmParams,
        denoise: crate::device::DenoiseParams,
        must_finish: bool,
    ) -> (Response, Vec<u8>) {
        let tile = self.local_tile(&wire);
        let neighbors = neighbors.map(|n| {
            let mut local = RenderTileNeighbors::default();
            n.fill(&mut local);
            for t in local.tiles.iter_mut().chain(std::iter::once(&mut local.target)) {
                t.buffer = self.local(t.buffer);
                t.rng_state = self.local(t.rng_state);
            }
            local
        });
        let task_type = if tile.task == RenderTileTask::Denoise { DeviceTaskType::Denoise } else { DeviceTaskType::PathTrace };
        let source = Arc::new(RemoteTile {
            device: Arc::clone(&self.device),
            pending: Mutex::new(Some(tile)),
            done: Mutex::new(None),
            neighbors,
            pixel_samples: AtomicU64::new(0),
        });

        let mut task = DeviceTask::new(task_type);
        task.tile_types = tile_types;
        task.film = film;
        task.denoise = denoise;
        task.must_finish = must_finish;
        let tile_source: Arc<dyn TileSource> = source.clone();
        task.tile_source = Some(tile_source);
        self.device.task_add(task);
        self.device.task_wait();

        if let Response::Error { message } = self.status() {
            return (Response::Error { message }, Vec::new());
        }
        let mut result = wire;
        if let Some(done) = source.done.lock().as_ref() {
            result.sample = done.sample;
        }
        let pixel_samples = source.pixel_samples.load(Ordering::Relaxed);
        (Response::TileDone { tile: result, pixel_samples }, Vec::new())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        for (_, mut mem) in self.memory.drain() {
            self.device.mem_free(&mut mem);
        }
    }
}

/// Tile source handing out the single tile of a `RunTile` request.
struct RemoteTile {
    device: Arc<dyn Device>,
    pending: Mutex<Option<RenderTile>>,
    done: Mutex<Option<RenderTile>>,
    neighbors: Option<RenderTileNeighbors>,
    pixel_samples: AtomicU64,
}

impl TileSource for RemoteTile {
    fn acquire_tile(&self, device: &Arc<dyn Device>, tile: &mut RenderTile, tile_types: TileTypes) -> bool {
        let mut pending = self.pending.lock();
        let wanted = match pending.as_ref().map(|t| t.task) {
            Some(RenderTileTask::PathTrace) => TileTypes::PATH_TRACE,
            Some(RenderTileTask::Denoise) => TileTypes::DENOISE,
            None => return false,
        };
        if !tile_types.contains(wanted) {
            return false;
        }
        let Some(mut next) = pending.take() else { return false };
        self.device.map_tile(device.as_ref(), &mut next);
        *tile = next;
        true
    }

    fn update_progress(&self, _tile: Option<&RenderTile>, pixel_samples: u64) {
        self.pixel_samples.fetch_add(pixel_samples, Ordering::Relaxed);
    }

    fn release_tile(&self, _device: &Arc<dyn Device>, tile: &mut RenderTile) {
        *self.done.lock() = Some(tile.clone());
    }

    fn get_cancel(&self) -> bool {
        false
    }

    fn map_neighbor_tiles(&self, neighbors: &mut RenderTileNeighbors, device: &Arc<dyn Device>) {
        if let Some(local) = &self.neighbors {
            *neighbors = local.clone();
        }
        for tile in neighbors.tiles.iter_mut() {
            self.device.map_tile(device.as_ref(), tile);
        }
        self.device.map_tile(device.as_ref(), &mut neighbors.target);
    }
}

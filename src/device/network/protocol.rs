//! Wire format between [`NetworkDevice`](super::NetworkDevice) and
//! [`DeviceServer`](super::DeviceServer).
//!
//! Every frame is a little-endian `u32` header length, the JSON header, a
//! `u32` payload length and the raw payload bytes (memory contents). One
//! request is always answered by exactly one response.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffers::FilmParams;
use crate::device::denoise::DenoiseParams;
use crate::device::kernel::{RequestedFeatures, ShaderEvalType};
use crate::device::memory::{DataType, DeviceMemory, DevicePtr, Extension, Interpolation, MemoryType};
use crate::device::task::{DeviceTask, DeviceTaskType, SplitMode};
use crate::device::DeviceInfo;
use crate::tile::{RenderTile, RenderTileNeighbors, RenderTileTask, TileTypes};
use crate::util::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for either part of a frame.
pub const MAX_FRAME: usize = 1 << 30;

/// Shape of a memory block, enough to rebuild the descriptor remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemDesc {
    pub name: String,
    pub mem_type: MemoryType,
    pub data_type: DataType,
    pub elements: usize,
    pub width: usize,
    pub height: usize,
}

impl MemDesc {
    pub fn of(mem: &DeviceMemory) -> Self {
        Self {
            name: mem.name().to_string(),
            mem_type: mem.mem_type,
            data_type: mem.data_type,
            elements: mem.data_elements,
            width: mem.data_width,
            height: mem.data_height,
        }
    }

    /// Zeroed host descriptor with this shape.
    pub fn build(&self) -> DeviceMemory {
        let mut mem = DeviceMemory::new(self.name.clone(), self.mem_type, self.data_type, self.elements);
        mem.resize(self.width, self.height);
        mem
    }
}

/// [`RenderTile`] without the host-side buffer handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireTile {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub start_sample: u32,
    pub num_samples: u32,
    pub sample: u32,
    pub resolution: u32,
    pub offset: i32,
    pub stride: i32,
    pub pass_stride: usize,
    pub buffer: DevicePtr,
    pub rng_state: DevicePtr,
    pub tile_index: usize,
    pub denoise: bool,
}

impl WireTile {
    pub fn of(tile: &RenderTile) -> Self {
        Self {
            x: tile.x,
            y: tile.y,
            w: tile.w,
            h: tile.h,
            start_sample: tile.start_sample,
            num_samples: tile.num_samples,
            sample: tile.sample,
            resolution: tile.resolution,
            offset: tile.offset,
            stride: tile.stride,
            pass_stride: tile.pass_stride,
            buffer: tile.buffer,
            rng_state: tile.rng_state,
            tile_index: tile.tile_index,
            denoise: tile.task == RenderTileTask::Denoise,
        }
    }

    pub fn to_tile(&self) -> RenderTile {
        RenderTile {
            x: self.x,
            y: self.y,
            w: self.w,
            h: self.h,
            start_sample: self.start_sample,
            num_samples: self.num_samples,
            sample: self.sample,
            resolution: self.resolution,
            offset: self.offset,
            stride: self.stride,
            pass_stride: self.pass_stride,
            buffer: self.buffer,
            rng_state: self.rng_state,
            buffers: None,
            tile_index: self.tile_index,
            task: if self.denoise { RenderTileTask::Denoise } else { RenderTileTask::PathTrace },
            epoch: 0,
        }
    }
}

/// Neighbourhood of a denoise tile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireNeighbors {
    pub tiles: Vec<WireTile>,
    pub target: WireTile,
}

impl WireNeighbors {
    pub fn of(neighbors: &RenderTileNeighbors) -> Self {
        Self {
            tiles: neighbors.tiles.iter().map(WireTile::of).collect(),
            target: WireTile::of(&neighbors.target),
        }
    }

    pub fn fill(&self, neighbors: &mut RenderTileNeighbors) {
        for (slot, tile) in neighbors.tiles.iter_mut().zip(&self.tiles) {
            *slot = tile.to_tile();
        }
        neighbors.target = self.target.to_tile();
    }
}

/// A [`DeviceTask`] without its tile source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    pub task_type: DeviceTaskType,
    pub region: (i32, i32, i32, i32),
    pub offset: i32,
    pub stride: i32,
    pub sample: u32,
    pub num_samples: u32,
    pub pass_stride: usize,
    pub pass_offset: usize,
    pub buffer: DevicePtr,
    pub rng_state: DevicePtr,
    pub rgba_byte: DevicePtr,
    pub rgba_half: DevicePtr,
    pub shader_input: DevicePtr,
    pub shader_output: DevicePtr,
    pub shader_eval_type: ShaderEvalType,
    pub shader_x: i32,
    pub shader_w: i32,
    pub film: FilmParams,
    pub denoise: DenoiseParams,
    pub split_mode: SplitMode,
    pub must_finish: bool,
    pub region_cleared: bool,
}

impl WireTask {
    pub fn of(task: &DeviceTask) -> Self {
        Self {
            task_type: task.task_type,
            region: (task.x, task.y, task.w, task.h),
            offset: task.offset,
            stride: task.stride,
            sample: task.sample,
            num_samples: task.num_samples,
            pass_stride: task.pass_stride,
            pass_offset: task.pass_offset,
            buffer: task.buffer,
            rng_state: task.rng_state,
            rgba_byte: task.rgba_byte,
            rgba_half: task.rgba_half,
            shader_input: task.shader_input,
            shader_output: task.shader_output,
            shader_eval_type: task.shader_eval_type,
            shader_x: task.shader_x,
            shader_w: task.shader_w,
            film: task.film,
            denoise: task.denoise,
            split_mode: task.split_mode,
            must_finish: task.must_finish,
            region_cleared: task.region_cleared,
        }
    }

    pub fn to_task(&self) -> DeviceTask {
        let (x, y, w, h) = self.region;
        let mut task = DeviceTask::new(self.task_type).with_region(x, y, w, h);
        task.offset = self.offset;
        task.stride = self.stride;
        task.sample = self.sample;
        task.num_samples = self.num_samples;
        task.pass_stride = self.pass_stride;
        task.pass_offset = self.pass_offset;
        task.buffer = self.buffer;
        task.rng_state = self.rng_state;
        task.rgba_byte = self.rgba_byte;
        task.rgba_half = self.rgba_half;
        task.shader_input = self.shader_input;
        task.shader_output = self.shader_output;
        task.shader_eval_type = self.shader_eval_type;
        task.shader_x = self.shader_x;
        task.shader_w = self.shader_w;
        task.film = self.film;
        task.denoise = self.denoise;
        task.split_mode = self.split_mode;
        task.must_finish = self.must_finish;
        task.region_cleared = self.region_cleared;
        task
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Hello { version: u32 },
    LoadKernels { features: RequestedFeatures },
    MemAlloc { key: DevicePtr, desc: MemDesc },
    /// Payload: the full host copy.
    MemCopyTo { key: DevicePtr, desc: MemDesc },
    MemCopyFrom { key: DevicePtr, y: usize, w: usize, h: usize, elem: usize },
    MemZero { key: DevicePtr },
    MemFree { key: DevicePtr },
    /// Payload: constant bytes.
    ConstCopyTo { name: String },
    /// Payload: the full host copy.
    TexAlloc { key: DevicePtr, desc: MemDesc, name: String, interpolation: Interpolation, extension: Extension },
    RunTask { task: WireTask },
    /// Render or denoise one tile acquired on the client.
    RunTile {
        tile: WireTile,
        neighbors: Option<WireNeighbors>,
        tile_types: TileTypes,
        film: FilmParams,
        denoise: DenoiseParams,
        must_finish: bool,
    },
    ErrorMessage,
    Goodbye,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Hello { version: u32, info: DeviceInfo },
    Ok,
    /// Payload: the bytes of the requested row span.
    Data { offset: usize },
    /// The tile after rendering, with its final sample.
    TileDone { tile: WireTile, pixel_samples: u64 },
    ErrorMessage { message: String },
    Error { message: String },
}

/// Write one frame and flush.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, header: &T, payload: &[u8]) -> Result<()> {
    let json = serde_json::to_vec(header)?;
    if json.len() > MAX_FRAME || payload.len() > MAX_FRAME {
        return Err(Error::protocol(format!("frame too large: {} + {} bytes", json.len(), payload.len())));
    }
    w.write_u32::<LittleEndian>(json.len() as u32)?;
    w.write_all(&json)?;
    w.write_u32::<LittleEndian>(payload.len() as u32)?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream before the header.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<(T, Vec<u8>)>> {
    let len = match r.read_u32::<LittleEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let header = read_block(r, len)?;
    let header: T = serde_json::from_slice(&header)?;
    let len = r.read_u32::<LittleEndian>()? as usize;
    let payload = read_block(r, len)?;
    Ok(Some((header, payload)))
}

fn read_block<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    if len > MAX_FRAME {
        return Err(Error::protocol(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, &Request::MemZero { key: 7 }, &[1, 2, 3]).unwrap();
        let json_len = u32::from_le_bytes(out[..4].try_into().unwrap()) as usize;
        let json = std::str::from_utf8(&out[4..4 + json_len]).unwrap();
        assert_eq!(json, r#"{"cmd":"mem_zero","key":7}"#);
        assert_eq!(&out[4 + json_len..], &[3, 0, 0, 0, 1, 2, 3]);

        let mut cursor = Cursor::new(out);
        let (req, payload): (Request, Vec<u8>) = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(req, Request::MemZero { key: 7 });
        assert_eq!(payload, vec![1, 2, 3]);
        assert!(read_frame::<_, Request>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut out = Vec::new();
        write_frame(&mut out, &Response::Ok, &[9; 16]).unwrap();
        out.truncate(out.len() - 4);
        assert!(read_frame::<_, Response>(&mut Cursor::new(out)).is_err());
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(u32::MAX).unwrap();
        let err = read_frame::<_, Request>(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_task_survives_the_wire() {
        let mut task = DeviceTask::new(DeviceTaskType::FilmConvert).with_region(1, 2, 3, 4);
        task.sample = 9;
        task.rgba_byte = 42;
        task.film.exposure = 2.0;
        let back = WireTask::of(&task).to_task();
        assert_eq!((back.x, back.y, back.w, back.h), (1, 2, 3, 4));
        assert_eq!(back.sample, 9);
        assert_eq!(back.rgba_byte, 42);
        assert_eq!(back.film.exposure, 2.0);
        assert!(back.tile_source.is_none());
    }
}

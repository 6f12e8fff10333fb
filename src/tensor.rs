// src/tensor.rs - dtype lookup and framework-independent tensor views
use crate::driver::DeviceId;
use crate::error::{EmmError, Result};

/// Element types resolvable from a dtype byte width.
///
/// The call surface hands the allocator a byte width rather than a framework
/// dtype object; the lookup table is fixed and deliberately small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Uint8,
    Float16,
    Float32,
    Float64,
}

impl DType {
    pub fn from_byte_width(width: usize) -> Result<DType> {
        match width {
            1 => Ok(DType::Uint8),
            2 => Ok(DType::Float16),
            4 => Ok(DType::Float32),
            8 => Ok(DType::Float64),
            _ => Err(EmmError::InvalidArgument(format!(
                "unsupported dtype byte width {width}"
            ))),
        }
    }

    pub fn byte_width(self) -> usize {
        match self {
            DType::Uint8 => 1,
            DType::Float16 => 2,
            DType::Float32 => 4,
            DType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Uint8 => "uint8",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }
}

/// Whether a view covers the key or the value half of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvKind {
    Key,
    Value,
}

/// Framework-independent view over one (layer, K-or-V) slice of a
/// reservation.
///
/// `addr` is only valid to dereference where the corresponding block offset
/// is currently mapped; adapters at the boundary wrap this descriptor into
/// framework-native tensors, outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvTensorView {
    pub addr: u64,
    pub len: usize,
    pub dtype: DType,
    pub device: DeviceId,
    pub layer: usize,
    pub kind: KvKind,
}

impl KvTensorView {
    pub fn num_elements(&self) -> usize {
        self.len / self.dtype.byte_width()
    }
}

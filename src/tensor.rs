use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ffi;

/// Convert quantized values to f32 using the runtime's scale/offset encoding.
///
/// The accelerator stores fixed-point tensors with a per-tensor `scale` and
/// `offset`. This reverses that encoding:
///
/// ```text
/// f32_value = (raw + offset) * scale
/// ```
///
/// Offsets are usually negative (they are the negated zero-point).
///
/// # Example
///
/// ```
/// use accel_session::tensor::dequantize;
///
/// let raw = vec![10u8, 20, 30];
/// let result = dequantize(&raw, -5, 0.1);
/// assert_eq!(result, vec![0.5, 1.5, 2.5]);
/// ```
pub fn dequantize<T: Copy + Into<f64>>(data: &[T], offset: i32, scale: f32) -> Vec<f32> {
    data.iter()
        .map(|&v| ((v.into() + offset as f64) * scale as f64) as f32)
        .collect()
}

/// Inverse of [`dequantize`] for one value, clamped to `[min, max]`.
///
/// ```
/// use accel_session::tensor::quantize;
///
/// assert_eq!(quantize(1.5, -5, 0.1, 0.0, 255.0), 20.0);
/// assert_eq!(quantize(100.0, 0, 0.1, 0.0, 255.0), 255.0);
/// ```
pub fn quantize(value: f32, offset: i32, scale: f32, min: f64, max: f64) -> f64 {
    if scale == 0.0 {
        return min.max(0.0).min(max);
    }
    let q = (value as f64 / scale as f64).round() - offset as f64;
    q.clamp(min, max)
}

/// Element data type of a tensor.
///
/// Fixed-point types ([`UFixed8`](Self::UFixed8) and friends) carry a
/// [`QuantParams`]; plain integer types are copied value-for-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Float16,
    Float32,
    SFixed8,
    SFixed16,
    UFixed8,
    UFixed16,
    Bool8,
    /// Unrecognized type code from the runtime.
    Unknown(u32),
}

impl From<u32> for DataType {
    fn from(v: u32) -> Self {
        match v {
            ffi::ACCEL_DATATYPE_INT_8 => DataType::Int8,
            ffi::ACCEL_DATATYPE_INT_16 => DataType::Int16,
            ffi::ACCEL_DATATYPE_INT_32 => DataType::Int32,
            ffi::ACCEL_DATATYPE_INT_64 => DataType::Int64,
            ffi::ACCEL_DATATYPE_UINT_8 => DataType::Uint8,
            ffi::ACCEL_DATATYPE_UINT_16 => DataType::Uint16,
            ffi::ACCEL_DATATYPE_UINT_32 => DataType::Uint32,
            ffi::ACCEL_DATATYPE_FLOAT_16 => DataType::Float16,
            ffi::ACCEL_DATATYPE_FLOAT_32 => DataType::Float32,
            ffi::ACCEL_DATATYPE_SFIXED_POINT_8 => DataType::SFixed8,
            ffi::ACCEL_DATATYPE_SFIXED_POINT_16 => DataType::SFixed16,
            ffi::ACCEL_DATATYPE_UFIXED_POINT_8 => DataType::UFixed8,
            ffi::ACCEL_DATATYPE_UFIXED_POINT_16 => DataType::UFixed16,
            ffi::ACCEL_DATATYPE_BOOL_8 => DataType::Bool8,
            other => DataType::Unknown(other),
        }
    }
}

impl DataType {
    pub fn code(self) -> u32 {
        match self {
            DataType::Int8 => ffi::ACCEL_DATATYPE_INT_8,
            DataType::Int16 => ffi::ACCEL_DATATYPE_INT_16,
            DataType::Int32 => ffi::ACCEL_DATATYPE_INT_32,
            DataType::Int64 => ffi::ACCEL_DATATYPE_INT_64,
            DataType::Uint8 => ffi::ACCEL_DATATYPE_UINT_8,
            DataType::Uint16 => ffi::ACCEL_DATATYPE_UINT_16,
            DataType::Uint32 => ffi::ACCEL_DATATYPE_UINT_32,
            DataType::Float16 => ffi::ACCEL_DATATYPE_FLOAT_16,
            DataType::Float32 => ffi::ACCEL_DATATYPE_FLOAT_32,
            DataType::SFixed8 => ffi::ACCEL_DATATYPE_SFIXED_POINT_8,
            DataType::SFixed16 => ffi::ACCEL_DATATYPE_SFIXED_POINT_16,
            DataType::UFixed8 => ffi::ACCEL_DATATYPE_UFIXED_POINT_8,
            DataType::UFixed16 => ffi::ACCEL_DATATYPE_UFIXED_POINT_16,
            DataType::Bool8 => ffi::ACCEL_DATATYPE_BOOL_8,
            DataType::Unknown(code) => code,
        }
    }

    /// Bytes per element, `None` for unknown types.
    pub fn size_of(self) -> Option<usize> {
        match self {
            DataType::Int8
            | DataType::Uint8
            | DataType::SFixed8
            | DataType::UFixed8
            | DataType::Bool8 => Some(1),
            DataType::Int16 | DataType::Uint16 | DataType::Float16 => Some(2),
            DataType::SFixed16 | DataType::UFixed16 => Some(2),
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(4),
            DataType::Int64 => Some(8),
            DataType::Unknown(_) => None,
        }
    }

    pub fn is_quantized(self) -> bool {
        matches!(
            self,
            DataType::SFixed8 | DataType::SFixed16 | DataType::UFixed8 | DataType::UFixed16
        )
    }
}

/// Scale/offset quantization of a fixed-point tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub offset: i32,
}

impl QuantParams {
    pub fn from_raw(raw: &ffi::AccelQuantizeParams) -> Option<Self> {
        (raw.encoding == ffi::ACCEL_QUANTIZATION_ENCODING_SCALE_OFFSET).then_some(Self {
            scale: raw.scale,
            offset: raw.offset,
        })
    }

    pub fn to_raw(quant: Option<QuantParams>) -> ffi::AccelQuantizeParams {
        match quant {
            Some(q) => ffi::AccelQuantizeParams {
                encoding: ffi::ACCEL_QUANTIZATION_ENCODING_SCALE_OFFSET,
                scale: q.scale,
                offset: q.offset,
            },
            None => ffi::AccelQuantizeParams {
                encoding: ffi::ACCEL_QUANTIZATION_ENCODING_UNDEFINED,
                scale: 0.0,
                offset: 0,
            },
        }
    }
}

/// Metadata for a single graph input or output.
///
/// Copied out of vendor memory when graphs are composed or retrieved, so it
/// stays valid after the vendor's own descriptors are freed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Tensor id inside the graph.
    pub id: u32,
    /// Tensor name from the model.
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<u32>,
    /// Set for fixed-point tensors.
    pub quant: Option<QuantParams>,
}

impl TensorInfo {
    /// Product of the dimensions. Fails if it does not fit in `usize`.
    pub fn element_count(&self) -> Result<usize, Error> {
        self.dims
            .iter()
            .try_fold(1usize, |n, &d| n.checked_mul(d as usize))
            .ok_or_else(|| self.too_large())
    }

    /// Size of the tensor's native buffer in bytes.
    pub fn byte_size(&self) -> Result<usize, Error> {
        let elem = self.data_type.size_of().ok_or_else(|| Error::Tensor {
            tensor: self.name.clone(),
            detail: format!("unsupported data type {:?}", self.data_type),
        })?;
        self.element_count()?
            .checked_mul(elem)
            .ok_or_else(|| self.too_large())
    }

    fn too_large(&self) -> Error {
        Error::Tensor {
            tensor: self.name.clone(),
            detail: format!("dimensions {:?} overflow the address space", self.dims),
        }
    }

    /// Copy the descriptor out of a vendor tensor record.
    ///
    /// # Safety
    ///
    /// `raw.name` must be null or a valid C string and `raw.dimensions` must
    /// point to `raw.rank` readable values (or be null when `rank == 0`).
    pub unsafe fn from_raw(raw: &ffi::AccelTensor) -> Self {
        let name = if raw.name.is_null() {
            String::new()
        } else {
            std::ffi::CStr::from_ptr(raw.name)
                .to_string_lossy()
                .into_owned()
        };
        let dims = if raw.dimensions.is_null() || raw.rank == 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts(raw.dimensions, raw.rank as usize).to_vec()
        };
        Self {
            id: raw.id,
            name,
            data_type: DataType::from(raw.data_type),
            dims,
            quant: QuantParams::from_raw(&raw.quantize_params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_codes() {
        for code in [
            ffi::ACCEL_DATATYPE_FLOAT_32,
            ffi::ACCEL_DATATYPE_FLOAT_16,
            ffi::ACCEL_DATATYPE_UFIXED_POINT_8,
            ffi::ACCEL_DATATYPE_INT_64,
        ] {
            assert_eq!(DataType::from(code).code(), code);
        }
        assert_eq!(DataType::from(0xdead), DataType::Unknown(0xdead));
        assert_eq!(DataType::Unknown(0xdead).size_of(), None);
        assert_eq!(DataType::UFixed16.size_of(), Some(2));
    }

    #[test]
    fn byte_size() {
        let info = TensorInfo {
            id: 0,
            name: "input".into(),
            data_type: DataType::Float32,
            dims: vec![1, 224, 224, 3],
            quant: None,
        };
        assert_eq!(info.byte_size().unwrap(), 224 * 224 * 3 * 4);

        let bad = TensorInfo {
            data_type: DataType::Unknown(7),
            ..info.clone()
        };
        assert!(bad.byte_size().is_err());

        let huge = TensorInfo {
            dims: vec![u32::MAX, u32::MAX, u32::MAX],
            ..info
        };
        assert!(matches!(huge.element_count(), Err(Error::Tensor { .. })));
        assert!(matches!(huge.byte_size(), Err(Error::Tensor { .. })));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn byte_size_overflow_after_element_count() {
        let wide = TensorInfo {
            id: 0,
            name: "wide".into(),
            data_type: DataType::Float32,
            dims: vec![1 << 31, 1 << 31],
            quant: None,
        };
        assert_eq!(wide.element_count().unwrap(), 1usize << 62);
        assert!(matches!(wide.byte_size(), Err(Error::Tensor { .. })));
    }

    #[test]
    fn quantize_clamps_and_rounds() {
        assert_eq!(quantize(0.26, 0, 0.1, 0.0, 255.0), 3.0);
        assert_eq!(quantize(-1.0, 0, 0.1, 0.0, 255.0), 0.0);
        assert_eq!(quantize(-1.0, 0, 0.1, -128.0, 127.0), -10.0);
    }

    #[test]
    fn from_raw_copies_descriptor() {
        let name = std::ffi::CString::new("logits").unwrap();
        let mut dims = [1u32, 1000];
        let raw = ffi::AccelTensor {
            id: 7,
            name: name.as_ptr(),
            tensor_type: ffi::ACCEL_TENSOR_TYPE_APP_READ,
            data_type: ffi::ACCEL_DATATYPE_UFIXED_POINT_8,
            quantize_params: ffi::AccelQuantizeParams {
                encoding: ffi::ACCEL_QUANTIZATION_ENCODING_SCALE_OFFSET,
                scale: 0.5,
                offset: -128,
            },
            rank: 2,
            dimensions: dims.as_mut_ptr(),
            client_buf: ffi::AccelClientBuffer {
                data: std::ptr::null_mut(),
                data_size: 0,
            },
        };
        let info = unsafe { TensorInfo::from_raw(&raw) };
        assert_eq!(info.name, "logits");
        assert_eq!(info.dims, vec![1, 1000]);
        assert_eq!(info.data_type, DataType::UFixed8);
        assert_eq!(info.quant, Some(QuantParams { scale: 0.5, offset: -128 }));
    }
}

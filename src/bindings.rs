// Persistent input/output tensors for one graph.

use half::f16;

use crate::backend::GraphInfo;
use crate::error::Error;
use crate::tensor::{dequantize, quantize, DataType, TensorInfo};

/// A tensor buffer in the graph's native element format.
///
/// The buffer is allocated once per binding and handed to the runtime as a
/// client buffer on every execute.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeTensor {
    info: TensorInfo,
    data: Vec<u8>,
}

impl NativeTensor {
    /// Zero-filled buffer sized for `info`.
    pub fn allocate(info: &TensorInfo) -> Result<Self, Error> {
        let size = info.byte_size()?;
        let mut data = Vec::new();
        data.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
        data.resize(size, 0);
        Ok(Self {
            info: info.clone(),
            data,
        })
    }

    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn mismatch(&self, detail: String) -> Error {
        Error::Tensor {
            tensor: self.info.name.clone(),
            detail,
        }
    }

    /// Copy raw bytes that are already in the native format.
    pub fn load_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() != self.data.len() {
            return Err(self.mismatch(format!(
                "expected {} bytes, got {}",
                self.data.len(),
                bytes.len()
            )));
        }
        self.data.copy_from_slice(bytes);
        Ok(())
    }

    /// Convert floats into the native format, quantizing if needed.
    pub fn load_f32(&mut self, values: &[f32]) -> Result<(), Error> {
        let count = self.info.element_count()?;
        if values.len() != count {
            return Err(self.mismatch(format!(
                "expected {count} elements, got {}",
                values.len()
            )));
        }
        let q = self.info.quant.unwrap_or(crate::tensor::QuantParams {
            scale: 1.0,
            offset: 0,
        });
        let out = &mut self.data;
        match self.info.data_type {
            DataType::Float32 => write_each(out, values, |v| v.to_ne_bytes()),
            DataType::Float16 => write_each(out, values, |v| f16::from_f32(v).to_ne_bytes()),
            DataType::Int8 => write_each(out, values, |v| (v as i8).to_ne_bytes()),
            DataType::Int16 => write_each(out, values, |v| (v as i16).to_ne_bytes()),
            DataType::Int32 => write_each(out, values, |v| (v as i32).to_ne_bytes()),
            DataType::Int64 => write_each(out, values, |v| (v as i64).to_ne_bytes()),
            DataType::Uint8 => write_each(out, values, |v| (v as u8).to_ne_bytes()),
            DataType::Uint16 => write_each(out, values, |v| (v as u16).to_ne_bytes()),
            DataType::Uint32 => write_each(out, values, |v| (v as u32).to_ne_bytes()),
            DataType::Bool8 => write_each(out, values, |v| [(v != 0.0) as u8]),
            DataType::UFixed8 => write_each(out, values, |v| {
                (quantize(v, q.offset, q.scale, 0.0, u8::MAX as f64) as u8).to_ne_bytes()
            }),
            DataType::UFixed16 => write_each(out, values, |v| {
                (quantize(v, q.offset, q.scale, 0.0, u16::MAX as f64) as u16).to_ne_bytes()
            }),
            DataType::SFixed8 => write_each(out, values, |v| {
                (quantize(v, q.offset, q.scale, i8::MIN as f64, i8::MAX as f64) as i8).to_ne_bytes()
            }),
            DataType::SFixed16 => write_each(out, values, |v| {
                (quantize(v, q.offset, q.scale, i16::MIN as f64, i16::MAX as f64) as i16)
                    .to_ne_bytes()
            }),
            DataType::Unknown(code) => {
                return Err(self.mismatch(format!("cannot convert floats to type {code:#x}")))
            }
        }
        Ok(())
    }

    /// Convert the buffer to a freshly allocated float array.
    pub fn to_f32(&self) -> Result<Vec<f32>, Error> {
        let d: &[u8] = &self.data;
        let (offset, scale) = self
            .info
            .quant
            .map(|q| (q.offset, q.scale))
            .unwrap_or((0, 1.0));
        let out = match self.info.data_type {
            DataType::Float32 => read_each(d, f32::from_ne_bytes),
            DataType::Float16 => read_each(d, |b: [u8; 2]| f16::from_ne_bytes(b).to_f32()),
            DataType::Int8 => read_each(d, |b: [u8; 1]| i8::from_ne_bytes(b) as f32),
            DataType::Int16 => read_each(d, |b: [u8; 2]| i16::from_ne_bytes(b) as f32),
            DataType::Int32 => read_each(d, |b: [u8; 4]| i32::from_ne_bytes(b) as f32),
            DataType::Int64 => read_each(d, |b: [u8; 8]| i64::from_ne_bytes(b) as f32),
            DataType::Uint8 => read_each(d, |b: [u8; 1]| b[0] as f32),
            DataType::Uint16 => read_each(d, |b: [u8; 2]| u16::from_ne_bytes(b) as f32),
            DataType::Uint32 => read_each(d, |b: [u8; 4]| u32::from_ne_bytes(b) as f32),
            DataType::Bool8 => read_each(d, |b: [u8; 1]| (b[0] != 0) as u8 as f32),
            DataType::UFixed8 => dequantize(d, offset, scale),
            DataType::UFixed16 => {
                let raw: Vec<u16> = read_each(d, u16::from_ne_bytes);
                dequantize(&raw, offset, scale)
            }
            DataType::SFixed8 => {
                let raw: Vec<i8> = read_each(d, i8::from_ne_bytes);
                dequantize(&raw, offset, scale)
            }
            DataType::SFixed16 => {
                let raw: Vec<i16> = read_each(d, i16::from_ne_bytes);
                dequantize(&raw, offset, scale)
            }
            DataType::Unknown(code) => {
                return Err(self.mismatch(format!("cannot convert type {code:#x} to floats")))
            }
        };
        Ok(out)
    }
}

fn write_each<const N: usize>(out: &mut [u8], values: &[f32], f: impl Fn(f32) -> [u8; N]) {
    for (chunk, &v) in out.chunks_exact_mut(N).zip(values) {
        chunk.copy_from_slice(&f(v));
    }
}

fn read_each<const N: usize, T>(data: &[u8], f: impl Fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|c| {
            let mut b = [0u8; N];
            b.copy_from_slice(c);
            f(b)
        })
        .collect()
}

/// Input and output tensors bound to one graph index.
#[derive(Debug)]
pub struct TensorBindings {
    graph_index: usize,
    pub(crate) inputs: Vec<NativeTensor>,
    pub(crate) outputs: Vec<NativeTensor>,
}

impl TensorBindings {
    pub fn for_graph(graph_index: usize, graph: &GraphInfo) -> Result<Self, Error> {
        let inputs = graph
            .inputs
            .iter()
            .map(NativeTensor::allocate)
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = graph
            .outputs
            .iter()
            .map(NativeTensor::allocate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            graph_index,
            inputs,
            outputs,
        })
    }

    pub fn graph_index(&self) -> usize {
        self.graph_index
    }

    pub fn inputs(&self) -> &[NativeTensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NativeTensor] {
        &self.outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::QuantParams;

    fn info(data_type: DataType, dims: Vec<u32>, quant: Option<QuantParams>) -> TensorInfo {
        TensorInfo {
            id: 0,
            name: "t".into(),
            data_type,
            dims,
            quant,
        }
    }

    #[test]
    fn float32_passthrough() {
        let mut t = NativeTensor::allocate(&info(DataType::Float32, vec![2, 2], None)).unwrap();
        assert_eq!(t.data().len(), 16);
        t.load_f32(&[1.0, -2.0, 3.5, 0.0]).unwrap();
        assert_eq!(t.to_f32().unwrap(), vec![1.0, -2.0, 3.5, 0.0]);
    }

    #[test]
    fn float16_conversion() {
        let mut t = NativeTensor::allocate(&info(DataType::Float16, vec![3], None)).unwrap();
        t.load_f32(&[0.5, 1.0, -4.0]).unwrap();
        assert_eq!(t.data().len(), 6);
        assert_eq!(t.to_f32().unwrap(), vec![0.5, 1.0, -4.0]);
    }

    #[test]
    fn ufixed8_quantizes() {
        let q = QuantParams {
            scale: 0.5,
            offset: -10,
        };
        let mut t = NativeTensor::allocate(&info(DataType::UFixed8, vec![3], Some(q))).unwrap();
        t.load_f32(&[0.0, 1.0, 500.0]).unwrap();
        assert_eq!(t.data(), &[10, 12, 255]);
        assert_eq!(t.to_f32().unwrap(), vec![0.0, 1.0, 122.5]);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut t = NativeTensor::allocate(&info(DataType::Float32, vec![4], None)).unwrap();
        t.load_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(t.load_f32(&[1.0]).is_err());
        assert!(t.load_bytes(&[0; 3]).is_err());
        assert_eq!(t.to_f32().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn unknown_type_cannot_allocate() {
        assert!(NativeTensor::allocate(&info(DataType::Unknown(3), vec![1], None)).is_err());
    }

    #[test]
    fn bindings_follow_graph() {
        let graph = GraphInfo {
            name: "g".into(),
            handle: None,
            inputs: vec![info(DataType::Float32, vec![1, 4], None)],
            outputs: vec![
                info(DataType::Float32, vec![1, 2], None),
                info(DataType::Uint8, vec![8], None),
            ],
        };
        let b = TensorBindings::for_graph(0, &graph).unwrap();
        assert_eq!(b.graph_index(), 0);
        assert_eq!(b.inputs().len(), 1);
        assert_eq!(b.outputs().len(), 2);
        assert_eq!(b.outputs()[1].data().len(), 8);
    }
}

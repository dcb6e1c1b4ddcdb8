//! Binary and base64 persistence for [`Tensor`] values.
//!
//! The on-disk block is `u64 magic`, `u32 samples`, `u32 width`,
//! `u32 height`, `u32 maps`, followed by the scalar payload in little-endian
//! order. A tensor stream is just blocks back to back until EOF.

use std::io::{self, Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{NetError, NetResult};
use crate::tensor::Tensor;
use crate::types::TensorShape;

pub const TENSOR_MAGIC: u64 = 0x5445_4e53_4f52_3234; // "TENSOR24"

/// Marker byte of the run-length-compressed byte form.
pub const RL_MARKER: u8 = b'X';
pub const RL_CODE: u8 = b'Y';
/// Minimum run length worth encoding; shorter runs are emitted verbatim.
pub const RL_MIN: usize = 6;

impl Tensor {
    pub fn serialize<W: Write>(&self, writer: &mut W) -> NetResult<()> {
        let shape = self.shape();
        writer.write_u64::<LittleEndian>(TENSOR_MAGIC)?;
        writer.write_u32::<LittleEndian>(shape.samples as u32)?;
        writer.write_u32::<LittleEndian>(shape.width as u32)?;
        writer.write_u32::<LittleEndian>(shape.height as u32)?;
        writer.write_u32::<LittleEndian>(shape.maps as u32)?;
        for &value in self.as_slice() {
            writer.write_f32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    /// Reads one serialization block, replacing the receiver's shape and
    /// contents.
    pub fn deserialize<R: Read>(&mut self, reader: &mut R) -> NetResult<()> {
        let magic = reader.read_u64::<LittleEndian>()?;
        if magic != TENSOR_MAGIC {
            return Err(NetError::BadMagic {
                expected: TENSOR_MAGIC,
                found: magic,
            });
        }
        let samples = reader.read_u32::<LittleEndian>()? as usize;
        let width = reader.read_u32::<LittleEndian>()? as usize;
        let height = reader.read_u32::<LittleEndian>()? as usize;
        let maps = reader.read_u32::<LittleEndian>()? as usize;
        let shape = TensorShape::new(samples, maps, height, width);
        self.resize(shape);
        for value in self.as_slice_mut() {
            *value = reader.read_f32::<LittleEndian>()?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> NetResult<Tensor> {
        let mut tensor = Tensor::from_dims(0, 0, 0, 0);
        tensor.deserialize(reader)?;
        Ok(tensor)
    }

    /// Base64 form of the whole tensor's serialization block.
    pub fn to_base64(&self) -> NetResult<String> {
        let mut bytes = Vec::new();
        self.serialize(&mut bytes)?;
        Ok(BASE64.encode(bytes))
    }

    pub fn from_base64(&mut self, encoded: &str) -> NetResult<()> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| NetError::Serialization(format!("invalid base64: {e}")))?;
        self.deserialize(&mut bytes.as_slice())
    }

    /// Base64 form of a single sample's raw scalars (no header).
    pub fn sample_to_base64(&self, sample: usize) -> String {
        let mut bytes = Vec::with_capacity(self.shape().elements_per_sample() * 4);
        for &value in self.sample_slice(sample) {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        BASE64.encode(bytes)
    }

    pub fn sample_from_base64(&mut self, encoded: &str, sample: usize) -> NetResult<()> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| NetError::Serialization(format!("invalid base64: {e}")))?;
        let target = self.sample_slice_mut(sample);
        if bytes.len() != target.len() * 4 {
            return Err(NetError::Serialization(format!(
                "sample payload is {} bytes, expected {}",
                bytes.len(),
                target.len() * 4
            )));
        }
        for (value, chunk) in target.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }
}

/// Reads serialized tensors until EOF.
pub fn read_tensor_stream<R: Read>(reader: &mut R) -> NetResult<Vec<Tensor>> {
    let mut tensors = Vec::new();
    loop {
        // Probe for EOF before committing to a block.
        let mut first = [0u8; 1];
        match reader.read(&mut first) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let mut chained = io::Cursor::new(first).chain(reader.by_ref());
        tensors.push(Tensor::read_from(&mut chained)?);
    }
    Ok(tensors)
}

pub fn write_tensor_stream<W: Write>(tensors: &[Tensor], writer: &mut W) -> NetResult<()> {
    for tensor in tensors {
        tensor.serialize(writer)?;
    }
    Ok(())
}

/// Run-length compression of a byte stream. Runs of `RL_MIN` or more
/// identical bytes become `X Y len_bytes len payload`; a literal marker is
/// escaped as `X X`.
pub fn rl_compress(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        let mut run = 1;
        while i + run < input.len() && input[i + run] == byte {
            run += 1;
        }
        if run >= RL_MIN {
            let len = run as u64;
            let len_le = len.to_le_bytes();
            let significant = len_le
                .iter()
                .rposition(|&b| b != 0)
                .map(|p| p + 1)
                .unwrap_or(1);
            output.push(RL_MARKER);
            output.push(RL_CODE);
            output.push(significant as u8);
            output.extend_from_slice(&len_le[..significant]);
            output.push(byte);
            i += run;
        } else {
            for _ in 0..run {
                if byte == RL_MARKER {
                    output.push(RL_MARKER);
                    output.push(RL_MARKER);
                } else {
                    output.push(byte);
                }
            }
            i += run;
        }
    }
    output
}

pub fn rl_decompress(input: &[u8]) -> NetResult<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if byte != RL_MARKER {
            output.push(byte);
            i += 1;
            continue;
        }
        let next = *input
            .get(i + 1)
            .ok_or_else(|| NetError::Serialization("truncated RLE marker".into()))?;
        if next == RL_MARKER {
            output.push(RL_MARKER);
            i += 2;
        } else if next == RL_CODE {
            let len_bytes = *input
                .get(i + 2)
                .ok_or_else(|| NetError::Serialization("truncated RLE length".into()))?
                as usize;
            if len_bytes == 0 || len_bytes > 8 || i + 3 + len_bytes >= input.len() {
                return Err(NetError::Serialization("malformed RLE code".into()));
            }
            let mut len_le = [0u8; 8];
            len_le[..len_bytes].copy_from_slice(&input[i + 3..i + 3 + len_bytes]);
            let len = u64::from_le_bytes(len_le) as usize;
            let payload = input[i + 3 + len_bytes];
            output.extend(std::iter::repeat(payload).take(len));
            i += 4 + len_bytes;
        } else {
            return Err(NetError::Serialization(format!(
                "unexpected byte {next:#x} after RLE marker"
            )));
        }
    }
    Ok(output)
}

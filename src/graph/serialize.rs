//! Model-file persistence: the `PAR`-magic parameter format and the legacy
//! migration path for files that predate it.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errors::{NetError, NetResult};
use crate::graph::NetGraph;
use crate::tensor::Tensor;

/// "OXNETPAR" in little-endian byte order.
pub const PARAMETER_MAGIC: u64 = 0x5241_5054_454e_584f;

impl NetGraph {
    /// Writes all trainable parameters, node by node in insertion order:
    /// magic, then per node (name length, parameter count, name bytes,
    /// serialized tensors). Nodes named in `skip_nodes` are left out.
    pub fn serialize_parameters<W: Write>(
        &self,
        writer: &mut W,
        skip_nodes: &[&str],
    ) -> NetResult<()> {
        writer.write_u64::<LittleEndian>(PARAMETER_MAGIC)?;
        for (_, node) in self.nodes() {
            let parameters = node.layer.parameters();
            if parameters.is_empty() || skip_nodes.contains(&node.name.as_str()) {
                continue;
            }
            writer.write_u32::<LittleEndian>(node.name.len() as u32)?;
            writer.write_u32::<LittleEndian>(parameters.len() as u32)?;
            writer.write_all(node.name.as_bytes())?;
            for parameter in parameters {
                parameter.data.serialize(writer)?;
            }
        }
        Ok(())
    }

    /// Reads a parameter file. Files carrying the magic are matched by node
    /// name; files without it are migrated: their tensor stream is assigned
    /// pairwise to the trainable nodes in topological order under the
    /// auto-generated names "node1"..."nodeN".
    pub fn deserialize_parameters<R: Read>(
        &mut self,
        reader: &mut R,
        skip_nodes: &[&str],
    ) -> NetResult<()> {
        let mut magic_bytes = [0u8; 8];
        reader.read_exact(&mut magic_bytes)?;
        let magic = u64::from_le_bytes(magic_bytes);
        if magic != PARAMETER_MAGIC {
            tracing::info!("parameter file has no magic, migrating legacy tensor stream");
            let mut chained = io::Cursor::new(magic_bytes).chain(reader.by_ref());
            return self.deserialize_legacy_parameters(&mut chained);
        }

        loop {
            let name_length = match reader.read_u32::<LittleEndian>() {
                Ok(v) => v as usize,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let parameter_count = reader.read_u32::<LittleEndian>()? as usize;
            let mut name_bytes = vec![0u8; name_length];
            reader.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| NetError::Serialization("node name is not valid UTF-8".into()))?;

            let tensors: NetResult<Vec<Tensor>> = (0..parameter_count)
                .map(|_| Tensor::read_from(reader))
                .collect();
            let tensors = tensors?;

            if skip_nodes.contains(&name.as_str()) {
                tracing::debug!("skipping parameters of node '{}'", name);
                continue;
            }
            let Some(id) = self.node_by_name(&name) else {
                tracing::warn!("parameter file names unknown node '{}', skipping", name);
                continue;
            };
            let node = self.node_mut(id);
            let mut parameters = node.layer.parameters_mut();
            if parameters.len() != tensors.len() {
                return Err(NetError::Serialization(format!(
                    "node '{}' has {} parameters but the file carries {}",
                    name,
                    parameters.len(),
                    tensors.len()
                )));
            }
            for (parameter, tensor) in parameters.iter_mut().zip(tensors) {
                if parameter.data.elements() != tensor.elements() {
                    return Err(NetError::Serialization(format!(
                        "parameter of node '{}' has {} elements, file carries {}",
                        name,
                        parameter.data.elements(),
                        tensor.elements()
                    )));
                }
                parameter.data = tensor.reshaped(parameter.data.shape())?;
                parameter.clear_delta();
            }
            tracing::debug!("loaded parameters of node '{}'", name);
        }
        Ok(())
    }

    fn deserialize_legacy_parameters<R: Read>(&mut self, reader: &mut R) -> NetResult<()> {
        let tensors = crate::tensor::serialize::read_tensor_stream(reader)?;
        let order: Vec<usize> = self.topological_order().to_vec();
        let trainable: Vec<usize> = order
            .into_iter()
            .filter(|&i| !self.node(crate::types::NodeId(i)).layer.parameters().is_empty())
            .collect();

        let mut cursor = tensors.into_iter();
        for (migrated, &index) in trainable.iter().enumerate() {
            let auto_name = format!("node{}", migrated + 1);
            let node = self.node_mut(crate::types::NodeId(index));
            let mut parameters = node.layer.parameters_mut();
            for parameter in parameters.iter_mut() {
                let Some(tensor) = cursor.next() else {
                    return Err(NetError::Serialization(format!(
                        "legacy parameter stream ended early at {auto_name}"
                    )));
                };
                if parameter.data.elements() != tensor.elements() {
                    return Err(NetError::Serialization(format!(
                        "legacy tensor has {} elements, {auto_name} expects {}",
                        tensor.elements(),
                        parameter.data.elements()
                    )));
                }
                parameter.data = tensor.reshaped(parameter.data.shape())?;
                parameter.clear_delta();
            }
            tracing::debug!("migrated legacy parameters as '{}'", auto_name);
        }
        if cursor.next().is_some() {
            tracing::warn!("legacy parameter stream has unused trailing tensors");
        }
        Ok(())
    }
}

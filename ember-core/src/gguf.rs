use crate::dtype::DType;
use crate::error::{EmberError, Result};
use crate::model::{Architecture, ModelInfo, ModelMetadata};
use crate::tensor::TensorInfo;
use memmap2::Mmap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub const GGUF_MAGIC: u32 = 0x46554747; // "GGUF" as LE u32
pub const GGUF_VERSION: u32 = 3;
const DEFAULT_ALIGNMENT: u64 = 32;
const MAX_STRING_LEN: u64 = 1024 * 1024;
const MAX_TENSOR_COUNT: u64 = 100_000;
const MAX_KV_COUNT: u64 = 100_000;
const MAX_ARRAY_LEN: u64 = 10_000_000;
const MAX_DIMENSIONS: u32 = 8;
const HEADER_MIN_SIZE: u64 = 4 + 4 + 8 + 8;
const RENDER_ARRAY_HEAD: usize = 8;

// metadata value type ids
const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl GgufValue {
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            GgufValue::Uint64(v) => Some(*v),
            other => other.as_i64().and_then(|v| u64::try_from(v).ok()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            GgufValue::Uint8(v) => Some(*v as i64),
            GgufValue::Int8(v) => Some(*v as i64),
            GgufValue::Uint16(v) => Some(*v as i64),
            GgufValue::Int16(v) => Some(*v as i64),
            GgufValue::Uint32(v) => Some(*v as i64),
            GgufValue::Int32(v) => Some(*v as i64),
            GgufValue::Int64(v) => Some(*v),
            GgufValue::Uint64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            GgufValue::Float32(v) => Some(*v),
            GgufValue::Float64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            GgufValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(items) => Some(items),
            _ => None,
        }
    }

    fn type_id(&self) -> u32 {
        match self {
            GgufValue::Uint8(_) => TYPE_U8,
            GgufValue::Int8(_) => TYPE_I8,
            GgufValue::Uint16(_) => TYPE_U16,
            GgufValue::Int16(_) => TYPE_I16,
            GgufValue::Uint32(_) => TYPE_U32,
            GgufValue::Int32(_) => TYPE_I32,
            GgufValue::Float32(_) => TYPE_F32,
            GgufValue::Bool(_) => TYPE_BOOL,
            GgufValue::String(_) => TYPE_STRING,
            GgufValue::Array(_) => TYPE_ARRAY,
            GgufValue::Uint64(_) => TYPE_U64,
            GgufValue::Int64(_) => TYPE_I64,
            GgufValue::Float64(_) => TYPE_F64,
        }
    }
}

/// Renders scalars plainly and summarizes long arrays as
/// `[a, b, ... (N items)]`.
impl fmt::Display for GgufValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GgufValue::String(s) => f.write_str(s),
            GgufValue::Bool(b) => write!(f, "{b}"),
            GgufValue::Float32(v) => write!(f, "{v}"),
            GgufValue::Float64(v) => write!(f, "{v}"),
            GgufValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().take(RENDER_ARRAY_HEAD).enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        GgufValue::String(s) => write!(f, "{s:?}")?,
                        other => write!(f, "{other}")?,
                    }
                }
                if items.len() > RENDER_ARRAY_HEAD {
                    write!(f, ", ... ({} items)", items.len())?;
                }
                f.write_str("]")
            }
            other => match other.as_i64() {
                Some(v) => write!(f, "{v}"),
                None => write!(f, "{other:?}"),
            },
        }
    }
}

/// Bounds-checked reader over the raw header bytes.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.data.len().saturating_sub(self.pos);
        if remaining < n {
            return Err(EmberError::Parse(format!(
                "unexpected EOF at offset {}: need {n} bytes, have {remaining}",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u64()?;
        if len > MAX_STRING_LEN {
            return Err(EmberError::StringTooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EmberError::Parse(format!("invalid UTF-8 in string: {e}")))
    }

    fn value(&mut self, value_type: u32) -> Result<GgufValue> {
        Ok(match value_type {
            TYPE_U8 => GgufValue::Uint8(self.array::<1>()?[0]),
            TYPE_I8 => GgufValue::Int8(self.array::<1>()?[0] as i8),
            TYPE_U16 => GgufValue::Uint16(u16::from_le_bytes(self.array()?)),
            TYPE_I16 => GgufValue::Int16(i16::from_le_bytes(self.array()?)),
            TYPE_U32 => GgufValue::Uint32(self.u32()?),
            TYPE_I32 => GgufValue::Int32(i32::from_le_bytes(self.array()?)),
            TYPE_F32 => GgufValue::Float32(f32::from_le_bytes(self.array()?)),
            TYPE_BOOL => GgufValue::Bool(self.array::<1>()?[0] != 0),
            TYPE_STRING => GgufValue::String(self.string()?),
            TYPE_ARRAY => {
                let elem_type = self.u32()?;
                let len = self.u64()?;
                if len > MAX_ARRAY_LEN {
                    return Err(EmberError::Parse(format!(
                        "array length {len} exceeds maximum {MAX_ARRAY_LEN}"
                    )));
                }
                let mut items = Vec::with_capacity(len.min(4096) as usize);
                for _ in 0..len {
                    items.push(self.value(elem_type)?);
                }
                GgufValue::Array(items)
            }
            TYPE_U64 => GgufValue::Uint64(self.u64()?),
            TYPE_I64 => GgufValue::Int64(i64::from_le_bytes(self.array()?)),
            TYPE_F64 => GgufValue::Float64(f64::from_le_bytes(self.array()?)),
            other => {
                return Err(EmberError::Parse(format!(
                    "unknown GGUF value type: {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Default)]
pub struct GgufParser;

impl GgufParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse the header of a GGUF file on disk. Tensor bytes are not read.
    pub fn parse_file(&self, path: &Path) -> Result<GgufFile> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_MIN_SIZE {
            return Err(EmberError::Parse("file too small to be valid GGUF".into()));
        }
        // SAFETY: read-only mapping, dropped before returning.
        let mmap = unsafe { Mmap::map(&file)? };
        self.parse_bytes(&mmap, file_size)
    }

    pub fn parse_bytes(&self, data: &[u8], file_size: u64) -> Result<GgufFile> {
        let mut cursor = Cursor::new(data);

        let magic = cursor.u32()?;
        if magic != GGUF_MAGIC {
            return Err(EmberError::InvalidMagic {
                expected: GGUF_MAGIC,
                got: magic,
            });
        }
        let version = cursor.u32()?;
        if version != GGUF_VERSION {
            return Err(EmberError::UnsupportedVersion(version));
        }

        let tensor_count = cursor.u64()?;
        if tensor_count > MAX_TENSOR_COUNT {
            return Err(EmberError::Parse(format!(
                "tensor count {tensor_count} exceeds maximum {MAX_TENSOR_COUNT}"
            )));
        }
        let kv_count = cursor.u64()?;
        if kv_count > MAX_KV_COUNT {
            return Err(EmberError::Parse(format!(
                "KV count {kv_count} exceeds maximum {MAX_KV_COUNT}"
            )));
        }

        let mut metadata = HashMap::with_capacity(kv_count as usize);
        for i in 0..kv_count {
            let key = cursor
                .string()
                .map_err(|e| EmberError::Parse(format!("failed to read KV key {i}: {e}")))?;
            let value_type = cursor.u32()?;
            let value = cursor.value(value_type).map_err(|e| {
                EmberError::Parse(format!("failed to read KV value for '{key}': {e}"))
            })?;
            metadata.insert(key, value);
        }

        let mut tensors = Vec::with_capacity(tensor_count as usize);
        for i in 0..tensor_count {
            let name = cursor
                .string()
                .map_err(|e| EmberError::Parse(format!("failed to read tensor {i} name: {e}")))?;
            let n_dims = cursor.u32()?;
            if n_dims > MAX_DIMENSIONS {
                return Err(EmberError::Parse(format!(
                    "tensor '{name}' has {n_dims} dimensions, max is {MAX_DIMENSIONS}"
                )));
            }
            let shape = (0..n_dims)
                .map(|_| cursor.u64())
                .collect::<Result<Vec<u64>>>()?;
            let type_id = cursor.u32()?;
            let dtype =
                DType::from_gguf_type_id(type_id).ok_or(EmberError::UnsupportedDType(type_id))?;
            let offset = cursor.u64()?;

            let elements = shape.iter().try_fold(1u64, |acc, &dim| {
                acc.checked_mul(dim)
                    .ok_or_else(|| EmberError::InvalidTensorShape {
                        name: name.clone(),
                        reason: "shape overflow".into(),
                    })
            })?;
            tensors.push(TensorInfo {
                size_bytes: dtype.storage_bytes(elements),
                name,
                dtype,
                shape,
                offset,
            });
        }

        let alignment = metadata
            .get("general.alignment")
            .and_then(GgufValue::as_u64)
            .filter(|&a| a > 0)
            .unwrap_or(DEFAULT_ALIGNMENT);
        let data_offset = (cursor.pos as u64).div_ceil(alignment) * alignment;

        // tensor offsets are relative to the data section
        for tensor in &tensors {
            let mut absolute = tensor.clone();
            absolute.offset = data_offset.checked_add(tensor.offset).ok_or_else(|| {
                EmberError::TensorOutOfBounds {
                    name: tensor.name.clone(),
                    offset: tensor.offset,
                    file_size,
                }
            })?;
            absolute.validate(file_size)?;
        }

        let mut spans: Vec<(u64, u64, &str)> = tensors
            .iter()
            .map(|t| (t.offset, t.size_bytes, t.name.as_str()))
            .collect();
        spans.sort_by_key(|&(offset, _, _)| offset);
        for pair in spans.windows(2) {
            let (a_off, a_len, a_name) = pair[0];
            let (b_off, _, b_name) = pair[1];
            if a_off + a_len > b_off {
                return Err(EmberError::Parse(format!(
                    "overlapping tensors: '{a_name}' [{a_off}..{}] overlaps '{b_name}' [{b_off}..]",
                    a_off + a_len
                )));
            }
        }

        Ok(GgufFile {
            version,
            metadata,
            tensors,
            data_offset,
            file_size,
            alignment,
        })
    }
}

/// Parsed GGUF header: metadata, tensor layout and where the data starts.
#[derive(Debug, Clone)]
pub struct GgufFile {
    pub version: u32,
    pub metadata: HashMap<String, GgufValue>,
    pub tensors: Vec<TensorInfo>,
    pub data_offset: u64,
    pub file_size: u64,
    pub alignment: u64,
}

impl GgufFile {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(GgufValue::as_str)
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(GgufValue::as_u32)
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(GgufValue::as_f32)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(GgufValue::as_bool)
    }

    pub fn get_array(&self, key: &str) -> Option<&[GgufValue]> {
        self.get(key).and_then(GgufValue::as_array)
    }

    pub fn architecture_name(&self) -> &str {
        self.get_str("general.architecture").unwrap_or("unknown")
    }

    /// Look up an architecture-prefixed key such as `llama.block_count`.
    pub fn arch_u32(&self, suffix: &str) -> Option<u32> {
        self.get_u32(&format!("{}.{suffix}", self.architecture_name()))
    }

    pub fn arch_f32(&self, suffix: &str) -> Option<f32> {
        self.get_f32(&format!("{}.{suffix}", self.architecture_name()))
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn model_metadata(&self) -> ModelMetadata {
        let embedding_dim = self.arch_u32("embedding_length").unwrap_or(0);
        let head_count = self.arch_u32("attention.head_count").unwrap_or(0);
        let vocab_size = self
            .arch_u32("vocab_size")
            .or_else(|| self.get_array("tokenizer.ggml.tokens").map(|a| a.len() as u32))
            .unwrap_or(0);

        ModelMetadata {
            architecture: Architecture::from_gguf_name(self.architecture_name()),
            name: self.get_str("general.name").map(String::from),
            parameters: self.tensors.iter().map(TensorInfo::num_elements).sum(),
            context_length: self.arch_u32("context_length").unwrap_or(2048),
            embedding_dim,
            feed_forward_dim: self.arch_u32("feed_forward_length"),
            head_count,
            head_count_kv: self
                .arch_u32("attention.head_count_kv")
                .unwrap_or(head_count),
            layer_count: self.arch_u32("block_count").unwrap_or(0),
            vocab_size,
            rope_freq_base: self.arch_f32("rope.freq_base"),
            rope_dimension_count: self.arch_u32("rope.dimension_count"),
            norm_eps: self.arch_f32("attention.layer_norm_rms_epsilon"),
            pooling_type: self.arch_u32("pooling_type"),
        }
    }

    /// Most common tensor type by byte volume, used for the short description.
    pub fn dominant_dtype(&self) -> Option<DType> {
        let mut volume: HashMap<DType, u64> = HashMap::new();
        for t in &self.tensors {
            *volume.entry(t.dtype).or_default() += t.size_bytes;
        }
        volume.into_iter().max_by_key(|&(_, v)| v).map(|(d, _)| d)
    }

    pub fn model_info(&self) -> ModelInfo {
        let metadata = self.model_metadata();
        let kv: BTreeMap<String, String> = self
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        let description = format!(
            "{} {} {}",
            self.architecture_name(),
            human_count(metadata.parameters),
            self.dominant_dtype().map(|d| d.name()).unwrap_or("empty"),
        );
        ModelInfo {
            description,
            size_bytes: self.tensors.iter().map(|t| t.size_bytes).sum(),
            tensor_count: self.tensors.len(),
            chat_template: self.get_str("tokenizer.chat_template").map(String::from),
            kv,
            metadata,
        }
    }

    /// Slice a tensor's bytes out of the whole file image.
    pub fn tensor_data<'a>(&self, tensor: &TensorInfo, file_data: &'a [u8]) -> Result<&'a [u8]> {
        let start = self.data_offset + tensor.offset;
        let end = start + tensor.size_bytes;
        if end > file_data.len() as u64 {
            return Err(EmberError::TensorOutOfBounds {
                name: tensor.name.clone(),
                offset: start,
                file_size: file_data.len() as u64,
            });
        }
        Ok(&file_data[start as usize..end as usize])
    }
}

/// Header-only model inspection: metadata without touching tensor data.
pub fn read_model_info(path: &Path) -> Result<ModelInfo> {
    GgufParser::new()
        .parse_file(path)
        .map(|gguf| gguf.model_info())
        .map_err(EmberError::into_load_error)
}

fn human_count(n: u64) -> String {
    match n {
        n if n >= 1_000_000_000 => format!("{:.1}B", n as f64 / 1e9),
        n if n >= 1_000_000 => format!("{:.1}M", n as f64 / 1e6),
        n if n >= 1_000 => format!("{:.1}K", n as f64 / 1e3),
        n => n.to_string(),
    }
}

/// Builds GGUF v3 images. Used for adapters and test fixtures.
#[derive(Debug, Default)]
pub struct GgufWriter {
    kv: Vec<(String, GgufValue)>,
    tensors: Vec<(String, DType, Vec<u64>, Vec<u8>)>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_kv(&mut self, key: impl Into<String>, value: GgufValue) -> &mut Self {
        self.kv.push((key.into(), value));
        self
    }

    pub fn add_str(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.add_kv(key, GgufValue::String(value.into()))
    }

    pub fn add_u32(&mut self, key: impl Into<String>, value: u32) -> &mut Self {
        self.add_kv(key, GgufValue::Uint32(value))
    }

    pub fn add_f32(&mut self, key: impl Into<String>, value: f32) -> &mut Self {
        self.add_kv(key, GgufValue::Float32(value))
    }

    /// `shape` is innermost-first; `bytes` must already be encoded as `dtype`.
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dtype: DType,
        shape: &[u64],
        bytes: Vec<u8>,
    ) -> &mut Self {
        self.tensors
            .push((name.into(), dtype, shape.to_vec(), bytes));
        self
    }

    pub fn add_f32_tensor(&mut self, name: impl Into<String>, shape: &[u64], data: &[f32]) -> &mut Self {
        let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_tensor(name, DType::F32, shape, bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        out.extend_from_slice(&GGUF_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.kv.len() as u64).to_le_bytes());

        for (key, value) in &self.kv {
            put_string(&mut out, key);
            out.extend_from_slice(&value.type_id().to_le_bytes());
            put_value(&mut out, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for (name, dtype, shape, bytes) in &self.tensors {
            let expected = dtype.storage_bytes(shape.iter().product());
            if expected != bytes.len() as u64 {
                return Err(EmberError::InvalidTensorShape {
                    name: name.clone(),
                    reason: format!("expected {expected} bytes, got {}", bytes.len()),
                });
            }
            put_string(&mut out, name);
            out.extend_from_slice(&(shape.len() as u32).to_le_bytes());
            for dim in shape {
                out.extend_from_slice(&dim.to_le_bytes());
            }
            out.extend_from_slice(&dtype.gguf_type_id().to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            offsets.push(offset);
            offset = (offset + bytes.len() as u64).div_ceil(DEFAULT_ALIGNMENT) * DEFAULT_ALIGNMENT;
        }

        let data_start = (out.len() as u64).div_ceil(DEFAULT_ALIGNMENT) * DEFAULT_ALIGNMENT;
        out.resize(data_start as usize, 0);
        for ((_, _, _, bytes), rel) in self.tensors.iter().zip(offsets) {
            out.resize((data_start + rel) as usize, 0);
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_value(out: &mut Vec<u8>, value: &GgufValue) -> Result<()> {
    match value {
        GgufValue::Uint8(v) => out.push(*v),
        GgufValue::Int8(v) => out.push(*v as u8),
        GgufValue::Uint16(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Uint32(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Bool(v) => out.push(u8::from(*v)),
        GgufValue::String(s) => put_string(out, s),
        GgufValue::Uint64(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Array(items) => {
            let elem_type = items.first().map(GgufValue::type_id).unwrap_or(TYPE_U8);
            if items.iter().any(|i| i.type_id() != elem_type) {
                return Err(EmberError::Parse("heterogeneous GGUF array".into()));
            }
            out.extend_from_slice(&elem_type.to_le_bytes());
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                put_value(out, item)?;
            }
        }
    }
    Ok(())
}

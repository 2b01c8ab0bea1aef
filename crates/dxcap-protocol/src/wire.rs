use std::borrow::Cow;

use crate::records::TraceBlock;

/// Trace frame magic bytes: "DX"
pub const MAGIC: [u8; 2] = [0x44, 0x58];

/// Maximum frame payload size: 1 GB (state snapshots of large applications
/// can be sizeable).
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024 * 1024;

/// Frame header size in bytes: magic(2) + flags(1) + thread_id(4) + length(4) = 11
pub const HEADER_SIZE: usize = 11;

/// Minimum payload size to attempt LZ4 compression (bytes).
const COMPRESSION_THRESHOLD: usize = 512;

bitflags::bitflags! {
    /// Frame flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const COMPRESSED  = 0b0000_0001;
        const CALL        = 0b0000_0010;
        const FILL_MEMORY = 0b0000_0100;
        const STATE       = 0b0000_1000;
    }
}

/// Encode a trace block into bytes (header + payload). LZ4 is applied when
/// `compress` is set and it actually shrinks the payload.
pub fn encode_block(block: &TraceBlock, compress: bool) -> Result<Vec<u8>, WireError> {
    let payload = rkyv::to_bytes::<rkyv::rancor::Error>(block)
        .map_err(|e| WireError::Serialization(e.to_string()))?;

    let (final_payload, compression_flag) = if compress && payload.len() > COMPRESSION_THRESHOLD {
        let compressed = lz4_flex::compress_prepend_size(&payload);
        if compressed.len() < payload.len() {
            (Cow::Owned(compressed), FrameFlags::COMPRESSED)
        } else {
            (Cow::Borrowed(payload.as_slice()), FrameFlags::empty())
        }
    } else {
        (Cow::Borrowed(payload.as_slice()), FrameFlags::empty())
    };

    let kind_flag = match block {
        TraceBlock::Call(_) => FrameFlags::CALL,
        TraceBlock::FillMemory(_) => FrameFlags::FILL_MEMORY,
        TraceBlock::State(_) => FrameFlags::STATE,
    };

    let flags = compression_flag | kind_flag;
    let payload_len = u32::try_from(final_payload.len())
        .map_err(|_| WireError::FrameTooLarge(u32::MAX))?;
    if payload_len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload_len));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + final_payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.push(flags.bits());
    frame.extend_from_slice(&block.thread_id().0.to_le_bytes());
    frame.extend_from_slice(&payload_len.to_le_bytes());
    frame.extend_from_slice(&final_payload);

    Ok(frame)
}

/// Decode a frame header. Returns (flags, thread_id, payload_length).
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<(FrameFlags, u32, u32), WireError> {
    if header[0] != MAGIC[0] || header[1] != MAGIC[1] {
        return Err(WireError::InvalidMagic);
    }

    let flags = FrameFlags::from_bits_truncate(header[2]);
    let thread_id = u32::from_le_bytes([header[3], header[4], header[5], header[6]]);
    let length = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(length));
    }

    Ok((flags, thread_id, length))
}

/// Decode a block from payload bytes, decompressing if the COMPRESSED flag is set.
pub fn decode_block(payload: &[u8], flags: FrameFlags) -> Result<TraceBlock, WireError> {
    let data: Cow<'_, [u8]> = if flags.contains(FrameFlags::COMPRESSED) {
        Cow::Owned(
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| WireError::DecompressionError(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(payload)
    };

    // rkyv validates alignment, and frame payloads start at arbitrary offsets.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(&data);

    rkyv::from_bytes::<TraceBlock, rkyv::rancor::Error>(&aligned)
        .map_err(|e| WireError::Serialization(e.to_string()))
}

/// Split a byte stream of consecutive frames into decoded blocks.
pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<TraceBlock>, WireError> {
    let mut blocks = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let (header, rest) = bytes.split_at(HEADER_SIZE);
        let header: &[u8; HEADER_SIZE] = header.try_into().map_err(|_| WireError::Truncated)?;
        let (flags, _thread_id, length) = decode_header(header)?;
        let length = length as usize;
        if rest.len() < length {
            return Err(WireError::Truncated);
        }
        let (payload, rest) = rest.split_at(length);
        blocks.push(decode_block(payload, flags)?);
        bytes = rest;
    }
    Ok(blocks)
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("invalid magic bytes")]
    InvalidMagic,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("decompression error: {0}")]
    DecompressionError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

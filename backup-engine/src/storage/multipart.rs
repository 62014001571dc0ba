//! Chunk planning for large transfers.

/// S3 rejects non-final parts below 5 MiB.
pub const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3 allows at most 10,000 parts per upload.
pub const S3_MAX_PARTS: u64 = 10_000;

/// One contiguous slice of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// 1-based part number
    pub number: u32,
    pub offset: u64,
    pub length: u64,
}

pub fn needs_multipart(size: u64, threshold: u64) -> bool {
    size > threshold
}

/// Split `total` bytes into parts of `chunk_size`, growing the chunk when
/// the part count would exceed `max_parts`. A zero-byte payload still yields
/// one empty part.
pub fn plan_parts(total: u64, chunk_size: u64, max_parts: u64) -> Vec<PartPlan> {
    let mut chunk = chunk_size.max(1);
    let max_parts = max_parts.max(1);
    if total.div_ceil(chunk) > max_parts {
        chunk = total.div_ceil(max_parts);
    }

    if total == 0 {
        return vec![PartPlan {
            number: 1,
            offset: 0,
            length: 0,
        }];
    }

    let mut parts = Vec::with_capacity(total.div_ceil(chunk) as usize);
    let mut offset = 0u64;
    let mut number = 1u32;
    while offset < total {
        let length = chunk.min(total - offset);
        parts.push(PartPlan {
            number,
            offset,
            length,
        });
        offset += length;
        number += 1;
    }
    parts
}

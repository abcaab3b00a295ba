//! On-disk block format. A block directory holds `meta.json` and a single
//! `chunks.dat` with every series of the block: label strings, delta-varint
//! timestamps, and raw IEEE-754 values, CRC-protected.

use crate::error::{ForgeError, Result};
use crate::types::{Labels, Point, Series, Timestamp};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

/// Chunk file magic bytes.
pub const CHUNKS_MAGIC: &[u8; 8] = b"TSFGBLK1";

const CHUNKS_VERSION: u32 = 1;
const META_FILENAME: &str = "meta.json";
const CHUNKS_FILENAME: &str = "chunks.dat";
const MAX_CHUNKS_PAYLOAD: usize = 1 << 30;

/// Block statistics carried in `meta.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockStats {
    #[serde(rename = "numSamples")]
    pub num_samples: u64,
    #[serde(rename = "numSeries")]
    pub num_series: u64,
}

/// Compaction lineage carried in `meta.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockCompaction {
    pub level: u32,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// Block metadata document. `max_time` is exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub ulid: String,
    #[serde(rename = "minTime")]
    pub min_time: Timestamp,
    #[serde(rename = "maxTime")]
    pub max_time: Timestamp,
    pub stats: BlockStats,
    pub compaction: BlockCompaction,
    pub version: u32,
}

/// Writes one block directory under `parent` and returns its meta.
/// Series points must already be sorted ascending by timestamp.
pub fn write_block(
    parent: &Path,
    ulid: &str,
    series: &[Series],
    min_time: Timestamp,
    max_time: Timestamp,
    compaction: BlockCompaction,
) -> Result<BlockMeta> {
    let mut payload: Vec<u8> = Vec::new();
    let mut num_samples: u64 = 0;
    write_u32(&mut payload, series.len() as u32);
    for s in series {
        write_u32(&mut payload, s.metric.len() as u32);
        for l in &s.metric {
            write_string(&mut payload, &l.name);
            write_string(&mut payload, &l.value);
        }
        write_u32(&mut payload, s.points.len() as u32);
        if let Some(first) = s.points.first() {
            write_i64(&mut payload, first.t);
            let mut prev = first.t;
            for p in &s.points[1..] {
                if p.t < prev {
                    return Err(ForgeError::Internal(
                        "series points must be sorted by timestamp".to_string(),
                    ));
                }
                write_var_u64(&mut payload, (p.t - prev) as u64);
                prev = p.t;
            }
            for p in &s.points {
                payload.extend_from_slice(&p.v.to_bits().to_le_bytes());
                num_samples += 1;
            }
        }
    }

    let dir = parent.join(ulid);
    std::fs::create_dir_all(&dir)?;

    let chunks_path = dir.join(CHUNKS_FILENAME);
    let mut w = BufWriter::new(File::create(&chunks_path)?);
    w.write_all(CHUNKS_MAGIC)?;
    let mut header = Vec::with_capacity(16);
    write_u32(&mut header, CHUNKS_VERSION);
    write_u32(&mut header, crc32(&payload));
    write_u64(&mut header, payload.len() as u64);
    w.write_all(&header)?;
    w.write_all(&payload)?;
    w.flush()?;

    let meta = BlockMeta {
        ulid: ulid.to_string(),
        min_time,
        max_time,
        stats: BlockStats {
            num_samples,
            num_series: series.len() as u64,
        },
        compaction,
        version: 1,
    };
    write_meta(&dir, &meta)?;
    Ok(meta)
}

fn write_meta(dir: &Path, meta: &BlockMeta) -> Result<()> {
    // Write-then-rename so readers never observe a torn meta file.
    let tmp = dir.join(format!("{}.tmp", META_FILENAME));
    let json = serde_json::to_vec_pretty(meta)
        .map_err(|e| ForgeError::Serialization(format!("failed to encode block meta: {}", e)))?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, dir.join(META_FILENAME))?;
    Ok(())
}

/// Reads `meta.json` from a block directory.
pub fn read_meta(dir: &Path) -> Result<BlockMeta> {
    let f = File::open(dir.join(META_FILENAME))?;
    serde_json::from_reader(BufReader::new(f)).map_err(|e| ForgeError::Corruption {
        details: format!("bad meta.json in {:?}: {}", dir, e),
    })
}

/// Reads every series of a block directory.
pub fn read_block_series(dir: &Path) -> Result<Vec<Series>> {
    let path = dir.join(CHUNKS_FILENAME);
    let mut f = BufReader::new(File::open(&path)?);

    let mut magic = [0u8; 8];
    f.read_exact(&mut magic)?;
    if &magic != CHUNKS_MAGIC {
        return Err(ForgeError::Corruption {
            details: format!("bad chunk file magic in {:?}", path),
        });
    }
    let version = read_u32(&mut f)?;
    if version != CHUNKS_VERSION {
        return Err(ForgeError::Corruption {
            details: format!("unknown chunk file version {} in {:?}", version, path),
        });
    }
    let expected_crc = read_u32(&mut f)?;
    let payload_len = read_u64(&mut f)? as usize;
    if payload_len > MAX_CHUNKS_PAYLOAD {
        return Err(ForgeError::Corruption {
            details: format!("refusing to read oversized chunk payload in {:?}", path),
        });
    }
    let mut payload = vec![0u8; payload_len];
    f.read_exact(&mut payload)?;
    if crc32(&payload) != expected_crc {
        return Err(ForgeError::Corruption {
            details: format!("chunk payload checksum mismatch in {:?}", path),
        });
    }

    let mut cur = Cursor::new(payload.as_slice());
    let series_count = read_u32(&mut cur)? as usize;
    let mut out = Vec::with_capacity(series_count);
    for _ in 0..series_count {
        let label_count = read_u32(&mut cur)? as usize;
        let mut pairs = Vec::with_capacity(label_count);
        for _ in 0..label_count {
            let name = read_string(&mut cur)?;
            let value = read_string(&mut cur)?;
            pairs.push((name, value));
        }
        let metric = Labels::from_pairs(pairs);

        let sample_count = read_u32(&mut cur)? as usize;
        let mut points = Vec::with_capacity(sample_count);
        if sample_count > 0 {
            let mut ts = Vec::with_capacity(sample_count);
            let base = read_i64(&mut cur)?;
            ts.push(base);
            let mut prev = base;
            for _ in 1..sample_count {
                let d = read_var_u64(&mut cur)? as i64;
                prev += d;
                ts.push(prev);
            }
            for t in ts {
                let mut bits = [0u8; 8];
                cur.read_exact(&mut bits)?;
                points.push(Point {
                    t,
                    v: f64::from_bits(u64::from_le_bytes(bits)),
                });
            }
        }
        out.push(Series { metric, points });
    }
    Ok(out)
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u32(r)? as usize;
    if len > 1 << 20 {
        return Err(ForgeError::Corruption {
            details: "refusing to read oversized string".to_string(),
        });
    }
    let mut b = vec![0u8; len];
    r.read_exact(&mut b)?;
    String::from_utf8(b).map_err(|e| ForgeError::Corruption {
        details: format!("invalid UTF-8 in chunk string: {}", e),
    })
}

fn read_var_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0;
    loop {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)?;
        v |= ((b[0] & 0x7F) as u64) << shift;
        if b[0] & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(ForgeError::Corruption {
                details: "varint overflows u64".to_string(),
            });
        }
    }
}

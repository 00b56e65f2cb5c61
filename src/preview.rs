//! In-process embedded preview extraction
//!
//! Most RAW containers carry one or more finished JPEGs (thumbnail, preview,
//! full-size render). This module finds them without decoding any sensor data:
//! TIFF-based containers are walked through their IFD chain, Fujifilm RAF has
//! a fixed header pointer, CR3 is walked box by box (THMB, PRVW, mdat), and
//! unknown layouts fall back to a marker scan for complete SOI..EOI streams.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::PreviewWindow;
use crate::error::{RawError, Result};
use crate::pool::MemoryBlockPool;

const MAX_IFDS: usize = 64;
const MAX_VALUES: usize = 64;
const RAF_MAGIC: &[u8] = b"FUJIFILMCCD-RAW";

/// Canon `uuid` box that wraps the PRVW medium preview
const CR3_PREVIEW_UUID: [u8; 16] = [
    0xea, 0xf4, 0x2b, 0x5e, 0x1c, 0x98, 0x4b, 0x88, 0xb9, 0xfb, 0xb7, 0xdc, 0x40, 0x6e, 0x4d, 0x16,
];
/// An mdat JPEG smaller than this is not the full-size render
const CR3_FULL_SIZE_MIN: usize = 1024 * 1024;

const TAG_COMPRESSION: u16 = 0x0103;
const TAG_PHOTOMETRIC: u16 = 0x0106;
const TAG_STRIP_OFFSETS: u16 = 0x0111;
const TAG_STRIP_BYTE_COUNTS: u16 = 0x0117;
const TAG_SUB_IFDS: u16 = 0x014A;
const TAG_JPEG_OFFSET: u16 = 0x0201;
const TAG_JPEG_LENGTH: u16 = 0x0202;
const TAG_EXIF_IFD: u16 = 0x8769;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Tiff { little_endian: bool },
    Cr3,
    Raf,
    Unknown,
}

/// Sniff the container from magic bytes
pub fn detect_container(data: &[u8]) -> Container {
    if data.starts_with(RAF_MAGIC) {
        return Container::Raf;
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" && matches!(&data[8..12], b"crx " | b"cr3 ") {
        return Container::Cr3;
    }
    if data.len() >= 8 {
        // II*\0 plus the ORF (IIRO/IIRS/MMOR) and RW2 (IIU\0) variants
        match &data[..4] {
            [b'I', b'I', 0x2A, 0x00] | [b'I', b'I', b'R', b'O'] | [b'I', b'I', b'R', b'S'] | [b'I', b'I', 0x55, 0x00] => {
                return Container::Tiff { little_endian: true };
            }
            [b'M', b'M', 0x00, 0x2A] | [b'M', b'M', b'O', b'R'] => {
                return Container::Tiff { little_endian: false };
            }
            _ => {}
        }
    }
    Container::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    /// JPEGInterchangeFormat pointer
    IfdThumbnail,
    /// Single JPEG-compressed strip
    IfdStrip,
    RafHeader,
    /// CR3 THMB thumbnail in the moov box
    Cr3Thumbnail,
    /// CR3 PRVW preview in the Canon preview uuid box
    Cr3Preview,
    /// CR3 full-size JPEG at the start of mdat
    Cr3FullSize,
    MarkerScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewCandidate {
    pub offset: usize,
    pub len: usize,
    pub source: CandidateSource,
}

impl PreviewCandidate {
    fn slice<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        data.get(self.offset..self.offset.checked_add(self.len)?)
    }
}

/// Every embedded JPEG that passes validation
pub fn find_candidates(data: &[u8]) -> Vec<PreviewCandidate> {
    let raw = match detect_container(data) {
        Container::Tiff { little_endian } => {
            let mut found = TiffWalker::new(data, little_endian).candidates();
            if found.is_empty() {
                found = scan_markers(data);
            }
            found
        }
        Container::Raf => {
            let mut found: Vec<_> = raf_candidate(data).into_iter().collect();
            found.extend(scan_markers(data));
            found
        }
        Container::Cr3 => cr3_candidates(data),
        Container::Unknown => scan_markers(data),
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|c| {
            let slice = c.slice(data)?;
            let len = validated_len(slice)?;
            let c = PreviewCandidate { len, ..c };
            seen.insert((c.offset, c.len)).then_some(c)
        })
        .collect()
}

/// Largest candidate inside the window, else the largest overall
pub fn select_preview(candidates: &[PreviewCandidate], window: PreviewWindow) -> Option<PreviewCandidate> {
    candidates
        .iter()
        .filter(|c| window.contains(c.len))
        .max_by_key(|c| c.len)
        .or_else(|| candidates.iter().max_by_key(|c| c.len))
        .copied()
}

pub fn extract_preview(data: &[u8], window: PreviewWindow) -> Result<&[u8]> {
    let candidates = find_candidates(data);
    let chosen = select_preview(&candidates, window)
        .ok_or_else(|| RawError::Processing("no embedded JPEG preview found".to_string()))?;

    debug!(
        "Selected {:?} preview at {} ({} bytes) from {} candidates",
        chosen.source,
        chosen.offset,
        chosen.len,
        candidates.len()
    );

    chosen
        .slice(data)
        .ok_or_else(|| RawError::Processing("preview range out of bounds".to_string()))
}

/// Length of the JPEG once trailing padding is trimmed, if it starts with
/// SOI and ends with EOI
fn validated_len(slice: &[u8]) -> Option<usize> {
    if slice.len() < 4 || slice[0] != 0xFF || slice[1] != 0xD8 || slice[2] != 0xFF {
        return None;
    }
    let trimmed = slice.len() - slice.iter().rev().take_while(|&&b| b == 0).count();
    (trimmed >= 4 && slice[trimmed - 2] == 0xFF && slice[trimmed - 1] == 0xD9).then_some(trimmed)
}

fn raf_candidate(data: &[u8]) -> Option<PreviewCandidate> {
    let offset = read_u32(data, 84, false)? as usize;
    let len = read_u32(data, 88, false)? as usize;
    (len > 0).then_some(PreviewCandidate {
        offset,
        len,
        source: CandidateSource::RafHeader,
    })
}

/// Top-level ISO-BMFF box
struct BmffBox {
    kind: [u8; 4],
    /// First byte after the size/type (and 64-bit size) header
    body: usize,
    end: usize,
}

fn top_level_boxes(data: &[u8]) -> Vec<BmffBox> {
    let mut boxes = Vec::new();
    let mut start = 0;

    while start + 8 <= data.len() {
        let Some(size) = read_u32(data, start, false) else {
            break;
        };
        let kind: [u8; 4] = match data[start + 4..start + 8].try_into() {
            Ok(kind) => kind,
            Err(_) => break,
        };
        let (body, len) = match size {
            0 => (start + 8, data.len() - start),
            1 => {
                let Some(hi) = read_u32(data, start + 8, false) else {
                    break;
                };
                let Some(lo) = read_u32(data, start + 12, false) else {
                    break;
                };
                let large = (u64::from(hi) << 32) | u64::from(lo);
                (start + 16, usize::try_from(large).unwrap_or(usize::MAX))
            }
            n => (start + 8, n as usize),
        };
        if len < body - start || body > data.len() {
            break;
        }

        let end = start.saturating_add(len).min(data.len());
        boxes.push(BmffBox { kind, body, end });
        start = end;
    }
    boxes
}

/// THMB, PRVW and full-size mdat JPEGs of a CR3 file. Sensor data in mdat
/// is never scanned beyond its first SOI.
fn cr3_candidates(data: &[u8]) -> Vec<PreviewCandidate> {
    let mut found = Vec::new();

    for bmff in top_level_boxes(data) {
        match &bmff.kind {
            b"moov" => {
                let moov = &data[bmff.body..bmff.end];
                if let Some(at) = moov.windows(4).position(|w| w == b"THMB") {
                    let from = bmff.body + at + 16;
                    found.extend(jpeg_in(data, from, bmff.end, CandidateSource::Cr3Thumbnail));
                }
            }
            b"uuid" if data.get(bmff.body..bmff.body + 16) == Some(&CR3_PREVIEW_UUID[..]) => {
                let prvw = bmff.body + 16 + 8;
                let is_prvw = data.get(prvw + 4..prvw + 8) == Some(&b"PRVW"[..]);
                let prvw_len = read_u32(data, prvw, false).unwrap_or(0) as usize;
                if is_prvw && prvw_len > 20 {
                    let limit = prvw.saturating_add(prvw_len).min(bmff.end);
                    found.extend(jpeg_in(data, prvw + 8 + 16, limit, CandidateSource::Cr3Preview));
                }
            }
            b"mdat" => {
                found.extend(
                    jpeg_in(data, bmff.body, bmff.end, CandidateSource::Cr3FullSize)
                        .filter(|c| c.len > CR3_FULL_SIZE_MIN),
                );
            }
            _ => {}
        }
    }
    found
}

/// First complete JPEG starting in `data[from..limit]`
fn jpeg_in(data: &[u8], from: usize, limit: usize, source: CandidateSource) -> Option<PreviewCandidate> {
    let window = data.get(from..limit)?;
    let soi = window.windows(3).position(|w| w == [0xFF, 0xD8, 0xFF])?;
    let len = jpeg_extent(&window[soi..])?;
    Some(PreviewCandidate {
        offset: from + soi,
        len,
        source,
    })
}

/// Complete JPEG streams found by walking markers from every SOI
fn scan_markers(data: &[u8]) -> Vec<PreviewCandidate> {
    let mut found = Vec::new();
    let mut pos = 0;

    while pos + 3 < data.len() {
        if data[pos] == 0xFF && data[pos + 1] == 0xD8 && data[pos + 2] == 0xFF {
            if let Some(len) = jpeg_extent(&data[pos..]) {
                found.push(PreviewCandidate {
                    offset: pos,
                    len,
                    source: CandidateSource::MarkerScan,
                });
                pos += len;
                continue;
            }
        }
        pos += 1;
    }
    found
}

/// Byte length of the JPEG starting at `data[0]`, following segment lengths
/// up to SOS and then the entropy-coded data up to EOI
fn jpeg_extent(data: &[u8]) -> Option<usize> {
    let mut pos = 2;
    loop {
        while data.get(pos)? == &0xFF && data.get(pos + 1)? == &0xFF {
            pos += 1;
        }
        if *data.get(pos)? != 0xFF {
            return None;
        }
        let marker = *data.get(pos + 1)?;
        match marker {
            0xD9 => return Some(pos + 2),
            0xD0..=0xD7 | 0x01 => pos += 2,
            _ => {
                let seg_len = read_u16(data, pos + 2, false)? as usize;
                if seg_len < 2 {
                    return None;
                }
                pos += 2 + seg_len;
                if marker == 0xDA {
                    break;
                }
            }
        }
    }

    // entropy-coded segment: stuffed 0xFF00 and restart markers continue it
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }
        match data[pos + 1] {
            0xFF => pos += 1,
            0x00 | 0xD0..=0xD7 => pos += 2,
            0xD9 => return Some(pos + 2),
            _ => {
                // another scan (progressive) or a table between scans
                let seg_len = read_u16(data, pos + 2, false)? as usize;
                pos += 2 + seg_len.max(2);
            }
        }
    }
    None
}

struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    value_offset: usize,
}

struct TiffWalker<'a> {
    data: &'a [u8],
    le: bool,
}

impl<'a> TiffWalker<'a> {
    fn new(data: &'a [u8], le: bool) -> Self {
        Self { data, le }
    }

    fn candidates(&self) -> Vec<PreviewCandidate> {
        let mut found = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: Vec<usize> = read_u32(self.data, 4, self.le).map(|o| o as usize).into_iter().collect();

        while let Some(offset) = queue.pop() {
            if offset == 0 || visited.len() >= MAX_IFDS || !visited.insert(offset) {
                continue;
            }
            let Some((entries, next)) = self.read_ifd(offset) else {
                continue;
            };
            if next != 0 {
                queue.push(next);
            }
            self.collect(&entries, &mut found, &mut queue);
        }
        found
    }

    fn collect(&self, entries: &[IfdEntry], found: &mut Vec<PreviewCandidate>, queue: &mut Vec<usize>) {
        let first = |tag: u16| {
            entries
                .iter()
                .find(|e| e.tag == tag)
                .and_then(|e| self.values(e).first().copied())
        };

        if let (Some(offset), Some(len)) = (first(TAG_JPEG_OFFSET), first(TAG_JPEG_LENGTH)) {
            found.push(PreviewCandidate {
                offset: offset as usize,
                len: len as usize,
                source: CandidateSource::IfdThumbnail,
            });
        }

        let compression = first(TAG_COMPRESSION);
        let photometric = first(TAG_PHOTOMETRIC);
        let jpeg_strip = match compression {
            Some(6) => true,
            // lossless JPEG is raw data unless the strip holds RGB/YCbCr
            Some(7) => matches!(photometric, Some(2) | Some(6)),
            _ => false,
        };
        if jpeg_strip {
            let offsets = entries.iter().find(|e| e.tag == TAG_STRIP_OFFSETS).map(|e| self.values(e));
            let counts = entries.iter().find(|e| e.tag == TAG_STRIP_BYTE_COUNTS).map(|e| self.values(e));
            if let (Some(offsets), Some(counts)) = (offsets, counts) {
                if offsets.len() == 1 && counts.len() == 1 {
                    found.push(PreviewCandidate {
                        offset: offsets[0] as usize,
                        len: counts[0] as usize,
                        source: CandidateSource::IfdStrip,
                    });
                }
            }
        }

        for entry in entries.iter().filter(|e| e.tag == TAG_SUB_IFDS || e.tag == TAG_EXIF_IFD) {
            queue.extend(self.values(entry).into_iter().map(|o| o as usize));
        }
    }

    fn read_ifd(&self, offset: usize) -> Option<(Vec<IfdEntry>, usize)> {
        let count = read_u16(self.data, offset, self.le)? as usize;
        let mut entries = Vec::with_capacity(count.min(512));
        for i in 0..count {
            let base = offset + 2 + i * 12;
            entries.push(IfdEntry {
                tag: read_u16(self.data, base, self.le)?,
                field_type: read_u16(self.data, base + 2, self.le)?,
                count: read_u32(self.data, base + 4, self.le)?,
                value_offset: base + 8,
            });
        }
        let next = read_u32(self.data, offset + 2 + count * 12, self.le).unwrap_or(0) as usize;
        Some((entries, next))
    }

    /// SHORT/LONG/IFD values, inline or out-of-line
    fn values(&self, entry: &IfdEntry) -> Vec<u32> {
        let width = match entry.field_type {
            3 => 2,
            4 | 13 => 4,
            _ => return Vec::new(),
        };
        let count = (entry.count as usize).min(MAX_VALUES);
        let start = if count * width <= 4 {
            entry.value_offset
        } else {
            match read_u32(self.data, entry.value_offset, self.le) {
                Some(o) => o as usize,
                None => return Vec::new(),
            }
        };

        (0..count)
            .map_while(|i| match width {
                2 => read_u16(self.data, start + i * 2, self.le).map(u32::from),
                _ => read_u32(self.data, start + i * 4, self.le),
            })
            .collect()
    }
}

fn read_u16(data: &[u8], at: usize, le: bool) -> Option<u16> {
    let bytes: [u8; 2] = data.get(at..at.checked_add(2)?)?.try_into().ok()?;
    Some(if le { u16::from_le_bytes(bytes) } else { u16::from_be_bytes(bytes) })
}

fn read_u32(data: &[u8], at: usize, le: bool) -> Option<u32> {
    let bytes: [u8; 4] = data.get(at..at.checked_add(4)?)?.try_into().ok()?;
    Some(if le { u32::from_le_bytes(bytes) } else { u32::from_be_bytes(bytes) })
}

/// Reads the RAW file into a pooled block and extracts its preview on the
/// blocking pool, bounded by a deadline.
pub struct NativePreviewExtractor {
    pool: Arc<MemoryBlockPool>,
    window: PreviewWindow,
    timeout: Duration,
}

impl NativePreviewExtractor {
    pub fn new(pool: Arc<MemoryBlockPool>, window: PreviewWindow, timeout: Duration) -> Self {
        Self { pool, window, timeout }
    }

    /// The preview JPEG bytes. A late blocking task finishes in the
    /// background and its result is discarded.
    pub async fn extract(&self, path: &Path) -> Result<Vec<u8>> {
        let pool = Arc::clone(&self.pool);
        let window = self.window;
        let path: PathBuf = path.to_path_buf();

        let task = tokio::task::spawn_blocking(move || read_and_extract(&pool, &path, window));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(RawError::Processing(format!("preview task failed: {}", join))),
            Err(_) => Err(RawError::Timeout {
                tool: "native-preview".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

fn read_and_extract(pool: &MemoryBlockPool, path: &Path, window: PreviewWindow) -> Result<Vec<u8>> {
    pool.with_file(path, |data| extract_preview(data, window).map(<[u8]>::to_vec))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal JPEG of exactly `len` bytes: SOI, SOS, entropy data with a stuffed byte, EOI
    fn fake_jpeg(len: usize) -> Vec<u8> {
        assert!(len >= 12);
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x12, 0xFF, 0x00];
        jpeg.resize(len - 2, 0x34);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    fn push_entry(buf: &mut Vec<u8>, tag: u16, field_type: u16, count: u32, value: u32) {
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(&field_type.to_le_bytes());
        buf.extend_from_slice(&count.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Little-endian TIFF: IFD0 -> thumbnail pointer, SubIFD -> JPEG strip
    fn fake_tiff(thumb: &[u8], preview: &[u8]) -> Vec<u8> {
        let ifd0 = 8u32;
        let ifd0_size = 2 + 3 * 12 + 4;
        let sub_ifd = ifd0 + ifd0_size;
        let sub_size = 2 + 3 * 12 + 4;
        let thumb_at = sub_ifd + sub_size;
        let preview_at = thumb_at + thumb.len() as u32;

        let mut buf = b"II\x2A\x00".to_vec();
        buf.extend_from_slice(&ifd0.to_le_bytes());

        buf.extend_from_slice(&3u16.to_le_bytes());
        push_entry(&mut buf, TAG_SUB_IFDS, 4, 1, sub_ifd);
        push_entry(&mut buf, TAG_JPEG_OFFSET, 4, 1, thumb_at);
        push_entry(&mut buf, TAG_JPEG_LENGTH, 4, 1, thumb.len() as u32);
        buf.extend_from_slice(&0u32.to_le_bytes());

        buf.extend_from_slice(&3u16.to_le_bytes());
        push_entry(&mut buf, TAG_COMPRESSION, 3, 1, 6);
        push_entry(&mut buf, TAG_STRIP_OFFSETS, 4, 1, preview_at);
        push_entry(&mut buf, TAG_STRIP_BYTE_COUNTS, 4, 1, preview.len() as u32);
        // points back at IFD0; the walker must not loop
        buf.extend_from_slice(&ifd0.to_le_bytes());

        buf.extend_from_slice(thumb);
        buf.extend_from_slice(preview);
        buf
    }

    #[test]
    fn test_detect_container() {
        assert_eq!(detect_container(b"II\x2A\x00\x08\x00\x00\x00"), Container::Tiff { little_endian: true });
        assert_eq!(detect_container(b"MM\x00\x2A\x00\x00\x00\x08"), Container::Tiff { little_endian: false });
        assert_eq!(detect_container(b"IIRO\x08\x00\x00\x00"), Container::Tiff { little_endian: true });
        assert_eq!(detect_container(b"\x00\x00\x00\x18ftypcrx \x00\x00\x00\x01"), Container::Cr3);
        assert_eq!(detect_container(b"FUJIFILMCCD-RAW 0201"), Container::Raf);
        assert_eq!(detect_container(b"garbage!"), Container::Unknown);
    }

    #[test]
    fn test_tiff_walk_finds_thumbnail_and_strip() {
        let thumb = fake_jpeg(200);
        let preview = fake_jpeg(60 * 1024);
        let data = fake_tiff(&thumb, &preview);

        let candidates = find_candidates(&data);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.source == CandidateSource::IfdThumbnail && c.len == 200));
        assert!(candidates.iter().any(|c| c.source == CandidateSource::IfdStrip && c.len == 60 * 1024));

        let chosen = extract_preview(&data, PreviewWindow::default()).unwrap();
        assert_eq!(chosen, preview.as_slice());
    }

    #[test]
    fn test_falls_back_to_largest_outside_window() {
        let thumb = fake_jpeg(200);
        let preview = fake_jpeg(1000);
        let data = fake_tiff(&thumb, &preview);

        let chosen = extract_preview(&data, PreviewWindow::default()).unwrap();
        assert_eq!(chosen.len(), 1000);
    }

    #[test]
    fn test_window_prefers_fitting_candidate_over_larger() {
        let window = PreviewWindow { min_bytes: 100, max_bytes: 500 };
        let candidates = [
            PreviewCandidate { offset: 0, len: 300, source: CandidateSource::MarkerScan },
            PreviewCandidate { offset: 0, len: 5000, source: CandidateSource::MarkerScan },
            PreviewCandidate { offset: 0, len: 50, source: CandidateSource::MarkerScan },
        ];
        assert_eq!(select_preview(&candidates, window).unwrap().len, 300);
        assert!(select_preview(&[], window).is_none());
    }

    #[test]
    fn test_raf_header_pointer() {
        let jpeg = fake_jpeg(4096);
        let mut data = RAF_MAGIC.to_vec();
        data.resize(100, 0);
        data[84..88].copy_from_slice(&100u32.to_be_bytes());
        data[88..92].copy_from_slice(&(jpeg.len() as u32).to_be_bytes());
        data.extend_from_slice(&jpeg);
        data.extend_from_slice(&[0u8; 64]);

        let candidates = find_candidates(&data);
        assert_eq!(candidates.len(), 1, "marker scan duplicate is dropped");
        assert_eq!(candidates[0].source, CandidateSource::RafHeader);
        assert_eq!(extract_preview(&data, PreviewWindow::default()).unwrap(), jpeg.as_slice());
    }

    fn bmff(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = ((body.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
        out
    }

    /// ftyp, moov with a THMB record, the PRVW uuid box, then mdat
    fn cr3_file(thumb: &[u8], preview: &[u8], mdat: &[u8]) -> Vec<u8> {
        let mut moov = vec![0u8; 8];
        moov.extend_from_slice(b"THMB");
        moov.extend_from_slice(&[0u8; 12]);
        moov.extend_from_slice(thumb);

        let mut prvw = vec![0u8; 16];
        prvw.extend_from_slice(preview);
        let mut uuid = CR3_PREVIEW_UUID.to_vec();
        uuid.extend_from_slice(&[0u8; 8]);
        uuid.extend_from_slice(&bmff(b"PRVW", &prvw));

        let mut data = bmff(b"ftyp", b"crx \x00\x00\x00\x01");
        data.extend_from_slice(&bmff(b"moov", &moov));
        data.extend_from_slice(&bmff(b"uuid", &uuid));
        data.extend_from_slice(&bmff(b"mdat", mdat));
        data
    }

    #[test]
    fn test_cr3_boxes_yield_thumbnail_and_preview_only() {
        let thumb = fake_jpeg(2048);
        let preview = fake_jpeg(60 * 1024);
        // sensor data that happens to contain a small complete JPEG
        let mut mdat = vec![0x11u8; 64];
        mdat.extend_from_slice(&fake_jpeg(4096));
        mdat.extend_from_slice(&[0x22u8; 64]);
        let data = cr3_file(&thumb, &preview, &mdat);

        assert_eq!(detect_container(&data), Container::Cr3);
        let candidates = find_candidates(&data);
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.source == CandidateSource::Cr3Thumbnail && c.len == 2048));
        assert!(candidates.iter().any(|c| c.source == CandidateSource::Cr3Preview && c.len == 60 * 1024));
        assert_eq!(extract_preview(&data, PreviewWindow::default()).unwrap(), preview.as_slice());
    }

    #[test]
    fn test_cr3_full_size_mdat_jpeg_is_preferred() {
        let full = fake_jpeg(CR3_FULL_SIZE_MIN + 4096);
        let mut mdat = full.clone();
        mdat.extend_from_slice(&[0x33u8; 128]);
        let data = cr3_file(&fake_jpeg(2048), &fake_jpeg(60 * 1024), &mdat);

        let candidates = find_candidates(&data);
        assert_eq!(candidates.len(), 3);
        let chosen = select_preview(&candidates, PreviewWindow::default()).unwrap();
        assert_eq!(chosen.source, CandidateSource::Cr3FullSize);
        assert_eq!(chosen.len, full.len());
    }

    #[test]
    fn test_marker_scan_skips_truncated_streams() {
        let mut data = b"unknown container header".to_vec();
        let small = fake_jpeg(300);
        let large = fake_jpeg(2048);
        data.extend_from_slice(&small);
        data.extend_from_slice(&[0xAA; 32]);
        data.extend_from_slice(&large);
        // truncated stream at the end
        data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x01]);

        assert_eq!(detect_container(&data), Container::Unknown);
        let candidates = find_candidates(&data);
        assert_eq!(candidates.len(), 2);
        assert_eq!(extract_preview(&data, PreviewWindow::default()).unwrap(), large.as_slice());
    }

    #[test]
    fn test_nested_exif_thumbnail_does_not_split_outer_jpeg() {
        let inner = fake_jpeg(64);
        let mut outer = vec![0xFF, 0xD8, 0xFF, 0xE1];
        outer.extend_from_slice(&((inner.len() + 2) as u16).to_be_bytes());
        outer.extend_from_slice(&inner);
        outer.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02, 0x55, 0x66, 0xFF, 0xD9]);

        let candidates = find_candidates(&outer);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].len, outer.len());
    }

    #[test]
    fn test_no_preview_is_an_error() {
        let data = vec![0u8; 1024];
        assert!(matches!(
            extract_preview(&data, PreviewWindow::default()),
            Err(RawError::Processing(_))
        ));
    }

    #[test]
    fn test_validated_len_trims_padding() {
        let mut jpeg = fake_jpeg(40);
        jpeg.extend_from_slice(&[0, 0, 0]);
        assert_eq!(validated_len(&jpeg), Some(40));
        assert_eq!(validated_len(&[0xFF, 0xD8, 0xFF, 0x00, 0x00]), None);
    }

    #[tokio::test]
    async fn test_extractor_reads_through_pool() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("frame.nef");
        let preview = fake_jpeg(80 * 1024);
        std::fs::write(&path, fake_tiff(&fake_jpeg(300), &preview)).unwrap();

        let pool = Arc::new(MemoryBlockPool::default());
        let extractor = NativePreviewExtractor::new(Arc::clone(&pool), PreviewWindow::default(), Duration::from_secs(5));
        let bytes = extractor.extract(&path).await.unwrap();

        assert_eq!(bytes, preview);
        let stats = pool.stats();
        assert_eq!(stats.in_use_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }
}

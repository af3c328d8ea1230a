//! Volume formatting.
//!
//! Lays directory segments onto a blank (or sacrificial) volume image,
//! before any mount. [`format_empty`] produces the canonical fresh layout:
//! one free entry covering every data sector, then the end-of-segment
//! marker. [`format_with_entries`] writes an explicit directory, which
//! tooling and tests use to construct precise pre-states.

use rt11_block::DataSource;
use rt11_error::{Result, Rt11Error};
use rt11_types::{
    rad50, Rad50Name, CHANNEL_BYTE, CREATION_DATE_WORD, ENTRY_LENGTH, EXTRA_BYTES, E_EOS, E_MPTY,
    E_PERM, FILENAME_WORDS, FIRST_ENTRY_OFFSET, FIRST_SEGMENT_SECTOR, HIGHEST_SEGMENT, JOB_BYTE,
    NEXT_SEGMENT, SECTORS_PER_SEGMENT, SECTOR_SIZE, SEGMENT_BYTES, SEGMENT_DATA_BLOCK,
    STATUS_WORD, TOTAL_LENGTH_WORD, TOTAL_SEGMENTS,
};

/// Length sentinel: the entry takes every data sector left on the volume.
pub const REST_OF_DATA: u16 = 0xffff;

/// One entry in an explicit directory layout.
#[derive(Debug, Clone, Copy)]
pub struct FormatEntry {
    pub status: u16,
    pub name: Rad50Name,
    pub length: u16,
    pub job: u8,
    pub channel: u8,
    pub date: u16,
}

impl FormatEntry {
    /// An end-of-segment marker.
    #[must_use]
    pub fn eos() -> Self {
        Self {
            status: E_EOS,
            name: [0; 3],
            length: 0,
            job: 0,
            channel: 0,
            date: 0,
        }
    }

    /// A free-space entry of `length` sectors.
    #[must_use]
    pub fn free(length: u16) -> Self {
        Self {
            status: E_MPTY,
            name: [0; 3],
            length,
            job: 0,
            channel: 0,
            date: 0,
        }
    }

    /// A permanent file entry; `None` if the name does not parse.
    #[must_use]
    pub fn file(name: &str, length: u16) -> Option<Self> {
        Some(Self {
            status: E_PERM,
            name: rad50::parse_filename(name)?,
            length,
            job: 0,
            channel: 0,
            date: 0,
        })
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

struct SegmentBuffer {
    bytes: Vec<u8>,
    entry_size: usize,
}

impl SegmentBuffer {
    fn new(extra_bytes: u16) -> Self {
        Self {
            bytes: vec![0_u8; SEGMENT_BYTES],
            entry_size: ENTRY_LENGTH + extra_bytes as usize,
        }
    }

    fn put_word(&mut self, offset: usize, word: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&word.to_le_bytes());
    }

    fn put_entry(&mut self, index: usize, entry: &FormatEntry) {
        let base = FIRST_ENTRY_OFFSET + index * self.entry_size;
        self.put_word(base + STATUS_WORD, entry.status);
        for (i, word) in entry.name.iter().enumerate() {
            self.put_word(base + FILENAME_WORDS + 2 * i, *word);
        }
        self.put_word(base + TOTAL_LENGTH_WORD, entry.length);
        self.bytes[base + JOB_BYTE] = entry.job;
        self.bytes[base + CHANNEL_BYTE] = entry.channel;
        self.put_word(base + CREATION_DATE_WORD, entry.date);
    }

    fn write_to(&self, source: &dyn DataSource, segment: u16) -> Result<()> {
        let offset = (u64::from(FIRST_SEGMENT_SECTOR)
            + u64::from(segment - 1) * u64::from(SECTORS_PER_SEGMENT))
            * SECTOR_SIZE as u64;
        source.write_all_at(offset, &self.bytes)
    }
}

fn check_geometry(
    source: &dyn DataSource,
    segments: u16,
    extra_bytes: u16,
) -> Result<(u32, u32)> {
    if segments == 0 {
        return Err(Rt11Error::InvalidArgument(
            "a directory needs at least one segment".to_owned(),
        ));
    }
    let entry_size = ENTRY_LENGTH + extra_bytes as usize;
    if (SEGMENT_BYTES - FIRST_ENTRY_OFFSET) / entry_size < 2 {
        return Err(Rt11Error::InvalidArgument(format!(
            "{extra_bytes} extra bytes per entry leaves no room for entries"
        )));
    }

    let sectors = (source.len_bytes() / SECTOR_SIZE as u64) as u32;
    let first_data = FIRST_SEGMENT_SECTOR + u32::from(segments) * SECTORS_PER_SEGMENT;
    if sectors <= first_data {
        return Err(Rt11Error::InvalidArgument(format!(
            "{segments} directory segments do not fit a {sectors}-sector volume"
        )));
    }
    if sectors - first_data > u32::from(u16::MAX) {
        return Err(Rt11Error::InvalidArgument(
            "volume data area exceeds the addressable sector range".to_owned(),
        ));
    }
    Ok((sectors, first_data))
}

/// Format a blank directory: one free entry spanning the whole data area,
/// then the end-of-segment marker.
pub fn format_empty(source: &dyn DataSource, segments: u16, extra_bytes: u16) -> Result<()> {
    let (sectors, first_data) = check_geometry(source, segments, extra_bytes)?;

    let mut buffer = SegmentBuffer::new(extra_bytes);
    buffer.put_word(TOTAL_SEGMENTS, segments);
    buffer.put_word(NEXT_SEGMENT, 0);
    buffer.put_word(HIGHEST_SEGMENT, 1);
    buffer.put_word(EXTRA_BYTES, extra_bytes);
    buffer.put_word(SEGMENT_DATA_BLOCK, first_data as u16);

    buffer.put_entry(0, &FormatEntry::free((sectors - first_data) as u16));
    buffer.put_entry(1, &FormatEntry::eos());

    buffer.write_to(source, 1)
}

/// Format a directory with an explicit per-segment entry layout.
///
/// The caller supplies the end-of-segment markers; a length of
/// [`REST_OF_DATA`] expands to every sector left on the volume. Segments
/// past the layout stay unallocated (uninitialized).
pub fn format_with_entries(
    source: &dyn DataSource,
    segments: u16,
    layout: &[Vec<FormatEntry>],
    extra_bytes: u16,
) -> Result<()> {
    if layout.is_empty() {
        return format_empty(source, segments, extra_bytes);
    }
    if layout.len() > usize::from(segments) {
        return Err(Rt11Error::InvalidArgument(format!(
            "layout of {} segments exceeds the declared {segments}",
            layout.len()
        )));
    }

    let (sectors, first_data) = check_geometry(source, segments, extra_bytes)?;
    let entry_size = ENTRY_LENGTH + extra_bytes as usize;
    let max_entries = (SEGMENT_BYTES - FIRST_ENTRY_OFFSET) / entry_size;

    let mut next_sector = first_data;
    for (i, entries) in layout.iter().enumerate() {
        if entries.len() > max_entries {
            return Err(Rt11Error::InvalidArgument(format!(
                "{} entries exceed the {max_entries} that fit in a segment",
                entries.len()
            )));
        }

        let segment = (i + 1) as u16;
        let last = i == layout.len() - 1;

        let mut buffer = SegmentBuffer::new(extra_bytes);
        buffer.put_word(TOTAL_SEGMENTS, segments);
        buffer.put_word(NEXT_SEGMENT, if last { 0 } else { segment + 1 });
        buffer.put_word(HIGHEST_SEGMENT, if i == 0 { layout.len() as u16 } else { 0 });
        buffer.put_word(EXTRA_BYTES, extra_bytes);
        buffer.put_word(SEGMENT_DATA_BLOCK, next_sector as u16);

        for (index, entry) in entries.iter().enumerate() {
            let mut entry = *entry;
            if entry.length == REST_OF_DATA {
                entry.length = (sectors - next_sector) as u16;
            }
            buffer.put_entry(index, &entry);
            next_sector += u32::from(entry.length);
            if next_sector > sectors {
                return Err(Rt11Error::InvalidArgument(format!(
                    "layout overcommits the volume at segment {segment} entry {index}"
                )));
            }
        }

        buffer.write_to(source, segment)?;
    }

    Ok(())
}

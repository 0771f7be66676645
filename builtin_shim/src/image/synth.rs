// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Image synthesis
//!
//! Turns a [`ModuleTemplate`] into a memory-resident image:
//! 1. Ask the segment locator where the template's own module lives
//! 2. Lay out copies of the import slots, resource tree and export tables
//! 3. Map a region for the header and the copies, at the template's
//!    preferred base if it has one and otherwise just below the module
//! 4. Write the DOS stub, the NT headers and a `.text`/`.data` section
//!    table, storing every address as a 32-bit offset from the region
//! 5. Seal the region and report the code and data ranges to the view
//!    registrar
//!
//! Offsets are unsigned and 32 bits wide, so everything an image refers to
//! has to sit less than 4 GiB above its base. An image that cannot be
//! placed that way is an error, never a truncated offset.

use super::layout::{
    DATA_SECTION, DIRECTORY_AREA_OFFSET, DIRECTORY_EXPORT, DIRECTORY_IMPORT, DIRECTORY_RESOURCE,
    DOS_SIGNATURE, DataDirectory, DosHeader, FileHeader, HEADER_SIZE, ImageWord,
    NT_HEADERS_OFFSET, NT_SIGNATURE, NUMBER_OF_DIRECTORY_ENTRIES, NtHeaders,
    OPTIONAL_HEADER_MAGIC, OptionalHeader, SCN_CNT_CODE, SCN_CNT_INITIALIZED_DATA,
    SCN_MEM_EXECUTE, SCN_MEM_READ, SCN_MEM_WRITE, SECTION_COUNT, SECTION_TABLE_OFFSET,
    SectionHeader, TEXT_SECTION,
};
use super::template::ModuleTemplate;
use super::to_rva;
use super::view::SyntheticImage;
use super::writer::AreaWriter;
use crate::host::{PageMapper, Protection, ViewRegistrar};
use crate::segments::{ModuleSegments, SegmentLocator, SegmentRange, page_round_up};
use crate::{BridgeError, Result};
use core::ptr::NonNull;
use tracing::{debug, trace, warn};
use zerocopy::{FromZeros, IntoBytes};

/// Alignment of the addresses tried below a module
const PLACEMENT_GRANULE: usize = 0x1_0000;

/// Builds synthetic images out of module templates
pub struct Synthesizer<'a> {
    mapper: &'a dyn PageMapper,
    locator: &'a dyn SegmentLocator,
    views: &'a dyn ViewRegistrar,
}

impl<'a> Synthesizer<'a> {
    /// Create a synthesizer over the given host collaborators
    pub fn new(
        mapper: &'a dyn PageMapper,
        locator: &'a dyn SegmentLocator,
        views: &'a dyn ViewRegistrar,
    ) -> Self {
        Self {
            mapper,
            locator,
            views,
        }
    }

    /// Synthesize an image for `template`
    ///
    /// The region lives for the rest of the process. A template with a
    /// preferred base either gets exactly that address or fails; there is
    /// no retry elsewhere.
    pub fn synthesize(&self, template: &ModuleTemplate) -> Result<SyntheticImage> {
        let page_size = self.mapper.page_size();
        let segments = self
            .locator
            .locate(template.address())
            .unwrap_or_else(|err| {
                warn!("{err}; describing the module with a placeholder page");
                ModuleSegments::placeholder(template.address(), page_size)
            });

        let mut area = AreaWriter::new(DIRECTORY_AREA_OFFSET);
        let directories = directories(template, &mut area)?;
        let len = page_round_up(DIRECTORY_AREA_OFFSET + area.len(), page_size);

        let lowest = lowest_reference(template, &segments, &area);
        let region = self.place(template.preferred_base(), lowest, len)?;
        let base = region.as_ptr() as usize;

        let bytes = match render(template, &segments, &area, directories, base, len, page_size) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.mapper.unmap_pages(region, len);
                return Err(err);
            }
        };
        // SAFETY: `map_pages` hands out a fresh, writable mapping of `len`
        // bytes that nothing else references yet, and `bytes` fits in it.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), region.as_ptr(), bytes.len()) };
        if let Err(err) = self.mapper.seal_pages(region, len) {
            self.mapper.unmap_pages(region, len);
            return Err(err);
        }

        self.views.register_range(
            segments.code.start,
            segments.code.size,
            Protection::ExecuteRead,
        );
        if !segments.data.is_empty() {
            self.views.register_range(
                segments.data.start,
                segments.data.size,
                Protection::ReadWrite,
            );
        }

        debug!(
            "synthesized image at {base:#x}+{len:#x}: code {:#x}+{:#x}, data {:#x}+{:#x}",
            segments.code.start, segments.code.size, segments.data.start, segments.data.size
        );
        Ok(SyntheticImage::new(base, len))
    }

    /// Map the image region
    ///
    /// A nonzero `preferred` base is the only address tried. Otherwise
    /// addresses below `lowest` are tried nearest first, then anywhere.
    fn place(&self, preferred: usize, lowest: usize, len: usize) -> Result<NonNull<u8>> {
        if preferred != 0 {
            return self.mapper.map_pages(Some(preferred), len);
        }
        for hint in placement_hints(lowest, len) {
            match self.mapper.map_pages(Some(hint), len) {
                Ok(region) => return Ok(region),
                Err(BridgeError::FixedMappingRefused(_)) => {
                    trace!("no room for a {len:#x}-byte image at {hint:#x}");
                }
                Err(err) => return Err(err),
            }
        }
        self.mapper.map_pages(None, len)
    }
}

/// Addresses to try for a region of `len` bytes ending at or below `lowest`
///
/// Sixteen granules stepping down from the highest fit, then doubling
/// distances out to 2 GiB below it.
fn placement_hints(lowest: usize, len: usize) -> impl Iterator<Item = usize> {
    let top = lowest
        .checked_sub(len)
        .map(|top| top & !(PLACEMENT_GRANULE - 1));
    let near = (0..16).map(|step| step * PLACEMENT_GRANULE);
    let far = (20..usize::BITS.min(32)).map(|shift| 1usize << shift);
    near.chain(far)
        .filter_map(move |distance| top?.checked_sub(distance))
        .filter(|&hint| hint != 0)
}

/// Lowest address the image refers to
fn lowest_reference(template: &ModuleTemplate, segments: &ModuleSegments, area: &AreaWriter) -> usize {
    let data = (!segments.data.is_empty()).then_some(segments.data.start);
    let entry = (template.entry_point() != 0).then_some(template.entry_point());
    [data, entry, area.lowest_target()]
        .into_iter()
        .flatten()
        .fold(segments.code.start, usize::min)
}

fn directories(
    template: &ModuleTemplate,
    area: &mut AreaWriter,
) -> Result<[DataDirectory; NUMBER_OF_DIRECTORY_ENTRIES]> {
    let mut directories = [DataDirectory::EMPTY; NUMBER_OF_DIRECTORY_ENTRIES];
    if let Some(imports) = template.imports().filter(|block| block.slot_count() > 0) {
        directories[DIRECTORY_IMPORT] = imports.write(area)?;
    }
    if let Some(resources) = template.resources() {
        directories[DIRECTORY_RESOURCE] = resources.write(area)?;
    }
    if let Some(exports) = template.exports() {
        directories[DIRECTORY_EXPORT] = exports.write(area)?;
    }
    Ok(directories)
}

/// Header and directory area as they appear at `base`
fn render(
    template: &ModuleTemplate,
    segments: &ModuleSegments,
    area: &AreaWriter,
    directories: [DataDirectory; NUMBER_OF_DIRECTORY_ENTRIES],
    base: usize,
    len: usize,
    page_size: usize,
) -> Result<Vec<u8>> {
    let dos = DosHeader {
        e_magic: DOS_SIGNATURE,
        _reserved: [0; 58],
        e_lfanew: NT_HEADERS_OFFSET as u32,
    };
    let nt = nt_headers(template, segments, directories, base, len, page_size)?;
    let sections = section_table(segments, base)?;

    let mut image = vec![0; DIRECTORY_AREA_OFFSET];
    image[..NT_HEADERS_OFFSET].copy_from_slice(dos.as_bytes());
    image[NT_HEADERS_OFFSET..SECTION_TABLE_OFFSET].copy_from_slice(nt.as_bytes());
    image[SECTION_TABLE_OFFSET..HEADER_SIZE].copy_from_slice(sections.as_bytes());
    image.extend(area.resolve(base)?);
    Ok(image)
}

fn size32(size: usize) -> Result<u32> {
    u32::try_from(size).map_err(|_| BridgeError::ImageTooLarge(size))
}

fn section(
    name: [u8; 8],
    range: SegmentRange,
    base: usize,
    characteristics: u32,
) -> Result<SectionHeader> {
    let offset = if range.is_empty() {
        0
    } else {
        to_rva(range.start, base)?
    };
    let size = size32(range.size)?;
    Ok(SectionHeader {
        name,
        virtual_size: size,
        virtual_address: offset,
        size_of_raw_data: size,
        pointer_to_raw_data: offset,
        characteristics,
        ..SectionHeader::new_zeroed()
    })
}

fn section_table(segments: &ModuleSegments, base: usize) -> Result<[SectionHeader; SECTION_COUNT]> {
    Ok([
        section(
            TEXT_SECTION,
            segments.code,
            base,
            SCN_CNT_CODE | SCN_MEM_EXECUTE | SCN_MEM_READ,
        )?,
        section(
            DATA_SECTION,
            segments.data,
            base,
            SCN_CNT_INITIALIZED_DATA | SCN_MEM_READ | SCN_MEM_WRITE,
        )?,
    ])
}

/// Bytes from the base to the end of the region or the furthest range
fn image_extent(segments: &ModuleSegments, base: usize, len: usize) -> Result<u32> {
    let code_end = to_rva(segments.code.end(), base)?;
    let data_end = if segments.data.is_empty() {
        0
    } else {
        to_rva(segments.data.end(), base)?
    };
    Ok(size32(len)?.max(code_end).max(data_end))
}

fn nt_headers(
    template: &ModuleTemplate,
    segments: &ModuleSegments,
    directories: [DataDirectory; NUMBER_OF_DIRECTORY_ENTRIES],
    base: usize,
    len: usize,
    page_size: usize,
) -> Result<NtHeaders> {
    let alignment = size32(page_size)?;
    #[allow(unused_mut)]
    let mut optional_header = OptionalHeader {
        magic: OPTIONAL_HEADER_MAGIC,
        size_of_code: size32(segments.code.size)?,
        size_of_initialized_data: size32(segments.data.size)?,
        address_of_entry_point: to_rva(template.entry_point(), base)?,
        base_of_code: to_rva(segments.code.start, base)?,
        image_base: base as ImageWord,
        section_alignment: alignment,
        file_alignment: alignment,
        size_of_image: image_extent(segments, base, len)?,
        size_of_headers: size32(HEADER_SIZE.next_multiple_of(page_size))?,
        subsystem: template.subsystem(),
        number_of_rva_and_sizes: NUMBER_OF_DIRECTORY_ENTRIES as u32,
        data_directory: directories,
        ..OptionalHeader::new_zeroed()
    };
    #[cfg(target_pointer_width = "32")]
    {
        optional_header.base_of_data = if segments.data.is_empty() {
            0
        } else {
            to_rva(segments.data.start, base)?
        };
    }

    Ok(NtHeaders {
        signature: NT_SIGNATURE,
        file_header: FileHeader {
            machine: template.machine(),
            number_of_sections: SECTION_COUNT as u16,
            time_date_stamp: 0,
            pointer_to_symbol_table: 0,
            number_of_symbols: 0,
            size_of_optional_header: size_of::<OptionalHeader>() as u16,
            characteristics: template.characteristics(),
        },
        optional_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments() -> ModuleSegments {
        ModuleSegments::new(
            SegmentRange::new(0x11_0000, 0x4000),
            SegmentRange::new(0x15_0000, 0x1000),
        )
    }

    #[test]
    fn test_section_table_offsets() {
        let [text, data] = section_table(&segments(), 0x10_0000).unwrap();
        assert_eq!(text.name(), ".text");
        assert_eq!(text.virtual_address, 0x1_0000);
        assert_eq!(text.pointer_to_raw_data, 0x1_0000);
        assert_eq!(text.size_of_raw_data, 0x4000);
        assert_eq!(text.characteristics & SCN_MEM_EXECUTE, SCN_MEM_EXECUTE);
        assert_eq!(data.name(), ".data");
        assert_eq!(data.virtual_address, 0x5_0000);
        assert_eq!(data.characteristics & SCN_MEM_WRITE, SCN_MEM_WRITE);
    }

    #[test]
    fn test_empty_data_section_still_declared() {
        let segments = ModuleSegments::new(SegmentRange::new(0x11_0000, 0x4000), SegmentRange::EMPTY);
        let [_, data] = section_table(&segments, 0x10_0000).unwrap();
        assert_eq!(data.name(), ".data");
        assert_eq!(data.virtual_size, 0);
        assert_eq!(data.size_of_raw_data, 0);
        assert_eq!(data.virtual_address, 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_section_out_of_reach_rejected() {
        let result = section_table(&segments(), 0x1_0000_0000 + 0x20_0000);
        assert!(matches!(result, Err(BridgeError::OffsetOutOfRange { .. })));
        let far = ModuleSegments::new(SegmentRange::new(0x1_0011_0000, 0x4000), SegmentRange::EMPTY);
        assert!(section_table(&far, 0x10_0000).is_err());
    }

    #[test]
    fn test_image_extent() {
        assert_eq!(image_extent(&segments(), 0x10_0000, 0x1000).unwrap(), 0x5_1000);
        assert_eq!(image_extent(&segments(), 0x10_0000, 0x10_0000).unwrap(), 0x10_0000);
    }

    #[test]
    fn test_placement_hints_below_module() {
        let hints: Vec<usize> = placement_hints(0x4012_3000, 0x2000).collect();
        assert_eq!(hints[0], 0x4012_0000);
        assert_eq!(hints[1], 0x4011_0000);
        assert!(hints.iter().all(|&hint| hint % PLACEMENT_GRANULE == 0));
        assert!(hints.iter().all(|&hint| hint + 0x2000 <= 0x4012_3000));
        assert!(hints.windows(2).all(|pair| pair[0] > pair[1]));
        // Distances of 1 MiB through 1 GiB still fit; 2 GiB does not.
        assert_eq!(hints.len(), 16 + 11);
    }

    #[test]
    fn test_placement_hints_near_zero() {
        assert_eq!(placement_hints(0x1000, 0x2000).count(), 0);
        let hints: Vec<usize> = placement_hints(0x3_0000, 0x1000).collect();
        assert_eq!(hints, vec![0x2_0000, 0x1_0000]);
    }

    #[test]
    fn test_headers_use_standard_fields() {
        let template = ModuleTemplate::library().with_entry_point(0x11_0040);
        let nt = nt_headers(
            &template,
            &segments(),
            [DataDirectory::EMPTY; NUMBER_OF_DIRECTORY_ENTRIES],
            0x10_0000,
            0x1000,
            0x1000,
        )
        .unwrap();
        assert_eq!(nt.file_header.size_of_optional_header as usize, size_of::<OptionalHeader>());
        assert_eq!(nt.optional_header.magic, OPTIONAL_HEADER_MAGIC);
        assert_eq!(nt.optional_header.address_of_entry_point, 0x1_0040);
        assert_eq!(nt.optional_header.base_of_code, 0x1_0000);
        assert_eq!(nt.optional_header.image_base, 0x10_0000);
        assert_eq!(nt.optional_header.size_of_headers, 0x1000);
        assert_eq!(nt.optional_header.number_of_rva_and_sizes, 16);
    }
}

//! Read-only navigation of on-disk PE images
//!
//! [`PeImage`] maps a file, validates just enough of its headers to trust the section
//! table, and translates between RVAs and file offsets. Every view it hands out borrows
//! the image, so nothing derived from a mapping can outlive [`PeImage::unload`].

mod version;

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::{scan::Pattern, Bitness};

/// Largest file [`PeImage::load`] accepts
pub const MAX_IMAGE_SIZE: u64 = 1 << 30;

const DOS_HEADER_SIZE: u64 = 64;
const E_LFANEW_OFFSET: usize = 0x3C;
const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
const FILE_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;

const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

/// An error for the [pe](crate::pe) module
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// no path given
    #[error("path is empty")]
    EmptyPath,
    /// file is larger than [`MAX_IMAGE_SIZE`]
    #[error("image is {0} bytes, max is {MAX_IMAGE_SIZE}")]
    TooLarge(u64),
    /// file is not a PE image
    #[error("not a PE image")]
    NotAPE,
    /// a header field points outside the file
    #[error("invalid offset in {0}")]
    InvalidOffset(&'static str),
    /// failed to open or map the file
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One entry of the section table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// name, without trailing NULs
    pub name: String,
    /// RVA of the section once loaded
    pub virtual_address: u32,
    /// bytes of the section stored in the file
    pub raw_size: u32,
    /// where those bytes start in the file
    pub file_offset: u32,
}

impl Section {
    fn contains_rva(&self, rva: u32) -> bool {
        let start = u64::from(self.virtual_address);
        (start..start + u64::from(self.raw_size)).contains(&u64::from(rva))
    }

    fn contains_file_offset(&self, offset: usize) -> bool {
        let start = self.file_offset as usize;
        start <= offset && (offset - start) < self.raw_size as usize
    }
}

#[derive(Debug)]
struct Loaded {
    path: PathBuf,
    map: Mmap,
    bitness: Bitness,
    image_base: u64,
    sections: Vec<Section>,
    version: Option<String>,
}

/// A PE file mapped for reading
///
/// Starts unloaded. Views returned by the lookup functions borrow the image,
/// while [`load`](Self::load) and [`unload`](Self::unload) need it mutably.
#[derive(Debug, Default)]
pub struct PeImage {
    loaded: Option<Loaded>,
}

impl PeImage {
    /// An unloaded image
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`, replacing whatever was loaded before
    ///
    /// On error the image is left unloaded.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), ImageError> {
        self.unload();

        let path = path.as_ref();
        self.loaded = Some(Loaded::open(path)?);

        Ok(())
    }

    /// Drop the mapping. Returns whether anything was loaded
    pub fn unload(&mut self) -> bool {
        match self.loaded.take() {
            Some(loaded) => {
                debug!(path = %loaded.path.display(), "unloaded image");
                true
            }
            None => false,
        }
    }

    /// Whether a file is currently mapped
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Size of the mapped file, 0 when unloaded
    pub fn size(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.map.len())
    }

    /// Preferred load address declared in the optional header
    pub fn image_base(&self) -> Option<u64> {
        self.loaded.as_ref().map(|l| l.image_base)
    }

    /// Machine mode implied by the optional header, PE32 or PE32+
    pub fn bitness(&self) -> Option<Bitness> {
        self.loaded.as_ref().map(|l| l.bitness)
    }

    /// File version from the version resource, `a.b.c.d`
    pub fn version(&self) -> Option<&str> {
        self.loaded.as_ref()?.version.as_deref()
    }

    /// Section table in file order, empty when unloaded
    pub fn sections(&self) -> &[Section] {
        self.loaded.as_ref().map_or(&[][..], |l| l.sections.as_slice())
    }

    /// The whole mapped file
    pub fn data(&self) -> Option<&[u8]> {
        self.loaded.as_ref().map(|l| &l.map[..])
    }

    /// Path of the loaded file
    pub fn path(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|l| l.path.as_path())
    }

    /// Address of the mapping in this process
    pub fn mapped_base_address(&self) -> Option<usize> {
        self.data().map(|data| data.as_ptr() as usize)
    }

    /// File offset that `rva` is stored at
    pub fn find_file_offset_by_rva(&self, rva: u32) -> Option<usize> {
        let loaded = self.loaded.as_ref()?;
        if rva as usize > loaded.map.len() {
            return None;
        }

        let section = loaded.sections.iter().find(|s| s.contains_rva(rva))?;
        let delta = (rva - section.virtual_address) as usize;
        let offset = (section.file_offset as usize).checked_add(delta)?;

        trace!(rva, offset, section = %section.name, "resolved rva");

        (offset < loaded.map.len()).then_some(offset)
    }

    /// View of the file starting at `rva`, up to the end of its section's raw data
    pub fn find_pointer_by_rva(&self, rva: u32) -> Option<&[u8]> {
        let loaded = self.loaded.as_ref()?;
        let start = self.find_file_offset_by_rva(rva)?;

        let section = loaded.sections.iter().find(|s| s.contains_rva(rva))?;
        let section_end = (section.file_offset as usize).saturating_add(section.raw_size as usize);
        let end = section_end.min(loaded.map.len());

        loaded.map.get(start..end)
    }

    /// RVA of the byte stored at file `offset`
    pub fn find_rva_by_file_offset(&self, offset: usize) -> Option<u32> {
        let loaded = self.loaded.as_ref()?;
        if offset > loaded.map.len() {
            return None;
        }

        let section = loaded
            .sections
            .iter()
            .find(|s| s.contains_file_offset(offset))?;

        let delta = u32::try_from(offset - section.file_offset as usize).ok()?;
        section.virtual_address.checked_add(delta)
    }

    /// File offset of the first match of `pattern` anywhere in the file
    pub fn find_file_offset_by_pattern(&self, pattern: &Pattern) -> Option<usize> {
        pattern.find(self.data()?)
    }
}

impl Loaded {
    fn open(path: &Path) -> Result<Self, ImageError> {
        if path.as_os_str().is_empty() {
            return Err(ImageError::EmptyPath);
        }

        let file = File::open(path)?;
        let size = file.metadata()?.len();

        if size > MAX_IMAGE_SIZE {
            return Err(ImageError::TooLarge(size));
        }

        if size <= DOS_HEADER_SIZE {
            return Err(ImageError::NotAPE);
        }

        // SAFETY: mapped read-only; the file changing underneath us is outside our control,
        // all reads below are bounds checked against the mapping's length
        let map = unsafe { Mmap::map(&file)? };

        let headers = Headers::parse(&map)?;
        let version = version::file_version(&map, headers.is_pe32_plus);

        debug!(
            path = %path.display(),
            size,
            image_base = headers.image_base,
            sections = headers.sections.len(),
            ?version,
            "loaded image"
        );

        Ok(Self {
            path: path.to_path_buf(),
            map,
            bitness: if headers.is_pe32_plus {
                Bitness::X64
            } else {
                Bitness::X86
            },
            image_base: headers.image_base,
            sections: headers.sections,
            version,
        })
    }
}

struct Headers {
    is_pe32_plus: bool,
    image_base: u64,
    sections: Vec<Section>,
}

impl Headers {
    fn parse(data: &[u8]) -> Result<Self, ImageError> {
        if data.get(..2) != Some(&b"MZ"[..]) {
            return Err(ImageError::NotAPE);
        }

        let e_lfanew = read_u32(data, E_LFANEW_OFFSET).ok_or(ImageError::NotAPE)? as i32;
        let nt = usize::try_from(e_lfanew).map_err(|_| ImageError::InvalidOffset("e_lfanew"))?;

        let file_header = nt + PE_SIGNATURE.len();
        let optional_header = file_header + FILE_HEADER_SIZE;
        if optional_header > data.len() {
            return Err(ImageError::InvalidOffset("e_lfanew"));
        }

        if &data[nt..file_header] != PE_SIGNATURE {
            return Err(ImageError::NotAPE);
        }

        let section_count = read_u16(data, file_header + 2).ok_or(ImageError::NotAPE)?;
        let optional_size = read_u16(data, file_header + 16).ok_or(ImageError::NotAPE)?;

        let magic = read_u16(data, optional_header)
            .ok_or(ImageError::InvalidOffset("optional header"))?;
        let (is_pe32_plus, image_base) = match magic {
            PE32_MAGIC => (false, read_u32(data, optional_header + 28).map(u64::from)),
            PE32_PLUS_MAGIC => (true, read_u64(data, optional_header + 24)),
            _ => return Err(ImageError::NotAPE),
        };
        let image_base = image_base.ok_or(ImageError::InvalidOffset("optional header"))?;

        let table_start = optional_header + usize::from(optional_size);
        let table_end = usize::from(section_count)
            .checked_mul(SECTION_HEADER_SIZE)
            .and_then(|len| table_start.checked_add(len))
            .filter(|&end| end <= data.len())
            .ok_or(ImageError::InvalidOffset("section table"))?;

        let sections = data[table_start..table_end]
            .chunks_exact(SECTION_HEADER_SIZE)
            .map(parse_section)
            .collect::<Vec<_>>();

        Ok(Self {
            is_pe32_plus,
            image_base,
            sections,
        })
    }
}

fn parse_section(entry: &[u8]) -> Section {
    let name = &entry[..8];
    let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());

    // entry is exactly one section header, the reads below cannot fail
    let field = |offset| read_u32(entry, offset).unwrap_or_default();

    Section {
        name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
        virtual_address: field(12),
        raw_size: field(16),
        file_offset: field(20),
    }
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    const NT: usize = 0x40;
    const OPTIONAL: usize = NT + 4 + FILE_HEADER_SIZE;

    struct Fixture {
        pe32_plus: bool,
        image_base: u64,
        sections: Vec<(&'static str, u32, u32, u32)>,
        size: usize,
    }

    impl Default for Fixture {
        fn default() -> Self {
            Self {
                pe32_plus: false,
                image_base: 0x40_0000,
                sections: vec![(".text", 0x1000, 0x1000, 0x400)],
                size: 0x2000,
            }
        }
    }

    impl Fixture {
        fn build(&self) -> Vec<u8> {
            let mut data = vec![0u8; self.size];
            data[..2].copy_from_slice(b"MZ");
            data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&(NT as u32).to_le_bytes());
            data[NT..NT + 4].copy_from_slice(PE_SIGNATURE);

            let optional_size: u16 = if self.pe32_plus { 0xF0 } else { 0xE0 };
            let machine: u16 = if self.pe32_plus { 0x8664 } else { 0x14C };
            data[NT + 4..NT + 6].copy_from_slice(&machine.to_le_bytes());
            data[NT + 6..NT + 8].copy_from_slice(&(self.sections.len() as u16).to_le_bytes());
            data[NT + 20..NT + 22].copy_from_slice(&optional_size.to_le_bytes());

            if self.pe32_plus {
                data[OPTIONAL..OPTIONAL + 2].copy_from_slice(&PE32_PLUS_MAGIC.to_le_bytes());
                data[OPTIONAL + 24..OPTIONAL + 32].copy_from_slice(&self.image_base.to_le_bytes());
            } else {
                data[OPTIONAL..OPTIONAL + 2].copy_from_slice(&PE32_MAGIC.to_le_bytes());
                data[OPTIONAL + 28..OPTIONAL + 32]
                    .copy_from_slice(&(self.image_base as u32).to_le_bytes());
            }

            let mut entry = OPTIONAL + usize::from(optional_size);
            for &(name, va, raw_size, file_offset) in &self.sections {
                data[entry..entry + name.len()].copy_from_slice(name.as_bytes());
                data[entry + 8..entry + 12].copy_from_slice(&raw_size.to_le_bytes());
                data[entry + 12..entry + 16].copy_from_slice(&va.to_le_bytes());
                data[entry + 16..entry + 20].copy_from_slice(&raw_size.to_le_bytes());
                data[entry + 20..entry + 24].copy_from_slice(&file_offset.to_le_bytes());
                entry += SECTION_HEADER_SIZE;
            }

            data
        }
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn load(bytes: &[u8]) -> (NamedTempFile, Result<PeImage, ImageError>) {
        let file = write_temp(bytes);
        let mut image = PeImage::new();
        let result = image.load(file.path()).map(|_| image);
        (file, result)
    }

    #[test]
    fn test_load_pe32() {
        let (_file, image) = load(&Fixture::default().build());
        let image = image.unwrap();

        assert!(image.is_loaded());
        assert_eq!(image.size(), 0x2000);
        assert_eq!(image.image_base(), Some(0x40_0000));
        assert_eq!(image.bitness(), Some(Bitness::X86));
        assert_eq!(image.version(), None);
        assert_eq!(
            image.sections(),
            &[Section {
                name: ".text".to_owned(),
                virtual_address: 0x1000,
                raw_size: 0x1000,
                file_offset: 0x400,
            }]
        );
    }

    #[test]
    fn test_load_pe32_plus() {
        let fixture = Fixture {
            pe32_plus: true,
            image_base: 0x1_4000_0000,
            sections: vec![(".text", 0x1000, 0x200, 0x400), (".data", 0x2000, 0x200, 0x600)],
            ..Default::default()
        };
        let (_file, image) = load(&fixture.build());
        let image = image.unwrap();

        assert_eq!(image.image_base(), Some(0x1_4000_0000));
        assert_eq!(image.bitness(), Some(Bitness::X64));
        let names = image.sections().iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, [".text", ".data"]);
    }

    #[test]
    fn test_small_file_is_not_a_pe() {
        let (_file, result) = load(&[0u8; 50]);
        assert!(matches!(result, Err(ImageError::NotAPE)));

        let mut data = Fixture::default().build();
        data[0] = b'Z';
        let (_file, result) = load(&data);
        assert!(matches!(result, Err(ImageError::NotAPE)));

        let mut data = Fixture::default().build();
        data[NT] = b'X';
        let (_file, result) = load(&data);
        assert!(matches!(result, Err(ImageError::NotAPE)));

        let mut data = Fixture::default().build();
        data[OPTIONAL] = 0;
        let (_file, result) = load(&data);
        assert!(matches!(result, Err(ImageError::NotAPE)));
    }

    #[test]
    fn test_header_offset_past_end() {
        let mut data = vec![0u8; 0x200];
        data[..2].copy_from_slice(b"MZ");
        data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&0x1000u32.to_le_bytes());
        let (_file, result) = load(&data);
        assert!(matches!(result, Err(ImageError::InvalidOffset("e_lfanew"))));

        // negative
        data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&(-8i32).to_le_bytes());
        let (_file, result) = load(&data);
        assert!(matches!(result, Err(ImageError::InvalidOffset("e_lfanew"))));
    }

    #[test]
    fn test_dos_header_size_boundary() {
        let mut data = vec![0u8; DOS_HEADER_SIZE as usize + 1];
        data[..2].copy_from_slice(b"MZ");
        data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&0x1000u32.to_le_bytes());

        // one byte past the dos header reaches header parsing
        let (_file, result) = load(&data);
        assert!(matches!(result, Err(ImageError::InvalidOffset("e_lfanew"))));

        // the same bytes without that last one never get there
        let (_file, result) = load(&data[..DOS_HEADER_SIZE as usize]);
        assert!(matches!(result, Err(ImageError::NotAPE)));
    }

    #[test]
    fn test_oversized_file_is_rejected() {
        let file = write_temp(b"MZ");
        // sparse, nothing is actually written
        file.as_file().set_len(MAX_IMAGE_SIZE + 1).unwrap();

        let mut image = PeImage::new();
        let result = image.load(file.path());
        assert!(matches!(result, Err(ImageError::TooLarge(size)) if size == MAX_IMAGE_SIZE + 1));
        assert!(!image.is_loaded());
    }

    #[test]
    fn test_section_table_past_end() {
        let mut data = Fixture::default().build();
        data[NT + 6..NT + 8].copy_from_slice(&0xFFFFu16.to_le_bytes());
        let (_file, result) = load(&data);
        assert!(matches!(
            result,
            Err(ImageError::InvalidOffset("section table"))
        ));
    }

    #[test]
    fn test_empty_and_missing_path() {
        let mut image = PeImage::new();
        assert!(matches!(image.load(""), Err(ImageError::EmptyPath)));

        let dir = tempfile::tempdir().unwrap();
        let result = image.load(dir.path().join("missing.exe"));
        assert!(matches!(result, Err(ImageError::Io(_))));
        assert!(!image.is_loaded());
    }

    #[test]
    fn test_unloaded_lookups() {
        let image = PeImage::new();
        assert_eq!(image.find_pointer_by_rva(0x1000), None);
        assert_eq!(image.find_file_offset_by_rva(0x1000), None);
        assert_eq!(image.find_rva_by_file_offset(0x400), None);
        assert_eq!(image.size(), 0);
        assert_eq!(image.image_base(), None);
        assert!(image.sections().is_empty());
        assert_eq!(image.data(), None);
    }

    #[test]
    fn test_rva_translation() {
        let mut data = Fixture::default().build();
        data[0x900] = 0xAB;
        let (_file, image) = load(&data);
        let image = image.unwrap();

        assert_eq!(image.find_file_offset_by_rva(0x1500), Some(0x900));
        let view = image.find_pointer_by_rva(0x1500).unwrap();
        assert_eq!(view[0], 0xAB);
        // runs to the end of the section's raw data
        assert_eq!(view.len(), 0x1400 - 0x900);

        // before the first section, past the section, past the file
        assert_eq!(image.find_pointer_by_rva(0x500), None);
        assert_eq!(image.find_pointer_by_rva(0x2000), None);
        assert_eq!(image.find_pointer_by_rva(0x3000), None);
    }

    #[test]
    fn test_view_clamped_to_mapping() {
        // section claims more raw data than the file holds
        let fixture = Fixture {
            sections: vec![(".text", 0x1000, 0x4000, 0x400)],
            ..Default::default()
        };
        let (_file, image) = load(&fixture.build());
        let image = image.unwrap();

        let view = image.find_pointer_by_rva(0x1000).unwrap();
        assert_eq!(view.len(), 0x2000 - 0x400);
        assert_eq!(image.find_pointer_by_rva(0x1C00).unwrap().len(), 0x2000 - 0x1000);
    }

    #[test]
    fn test_file_offset_to_rva() {
        let (_file, image) = load(&Fixture::default().build());
        let image = image.unwrap();

        assert_eq!(image.find_rva_by_file_offset(0x400), Some(0x1000));
        assert_eq!(image.find_rva_by_file_offset(0x900), Some(0x1500));
        assert_eq!(image.find_rva_by_file_offset(0x13FF), Some(0x1FFF));
        assert_eq!(image.find_rva_by_file_offset(0x1400), None);
        assert_eq!(image.find_rva_by_file_offset(0x10), None);
        assert_eq!(image.find_rva_by_file_offset(0x10_0000), None);
    }

    #[test]
    fn test_reload_and_unload() {
        let first = write_temp(&Fixture::default().build());
        let second = write_temp(
            &Fixture {
                image_base: 0x1000_0000,
                ..Default::default()
            }
            .build(),
        );

        let mut image = PeImage::new();
        image.load(first.path()).unwrap();
        assert_eq!(image.path(), Some(first.path()));

        image.load(second.path()).unwrap();
        assert_eq!(image.image_base(), Some(0x1000_0000));

        // a failed load leaves nothing behind
        assert!(image.load("").is_err());
        assert!(!image.is_loaded());

        image.load(first.path()).unwrap();
        assert!(image.unload());
        assert!(!image.unload());
        assert_eq!(image.find_pointer_by_rva(0x1000), None);
    }

    #[test]
    fn test_pattern_in_image() {
        let mut data = Fixture::default().build();
        data[0x480..0x485].copy_from_slice(&[0x55, 0x8B, 0xEC, 0x83, 0xEC]);
        let (_file, image) = load(&data);
        let image = image.unwrap();

        let pattern = Pattern::new("55 8B EC ?? EC").unwrap();
        let offset = image.find_file_offset_by_pattern(&pattern).unwrap();
        assert_eq!(offset, 0x480);
        assert_eq!(image.find_rva_by_file_offset(offset), Some(0x1080));
        assert!(image.mapped_base_address().is_some());

        assert_eq!(PeImage::new().find_file_offset_by_pattern(&pattern), None);
    }
}

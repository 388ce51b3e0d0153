//! Minimal PE32+ reader for the signed applet.
//!
//! Only the DOS header, NT headers, section table and the security directory
//! are looked at. The image is copied section by section into a flat buffer;
//! relocations and imports are left alone because the secure monitor verifies
//! the result, not us.

use core::mem::size_of;

use log::debug;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::FormatError;

pub const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d; // MZ
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;
pub const IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION: u16 = 16;
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;
pub const IMAGE_NUMBEROF_DIRECTORY_ENTRIES: usize = 16;

pub const WIN_CERT_REVISION_2_0: u16 = 0x200;
pub const WIN_CERT_TYPE_PKCS_SIGNED_DATA: u16 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DosHeader {
    pub e_magic: u16,
    /// Real-mode stub fields, unused here.
    pub e_stub: [u16; 29],
    pub e_lfanew: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub check_sum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directory: [DataDirectory; IMAGE_NUMBEROF_DIRECTORY_ENTRIES],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }
}

/// Header of a `WIN_CERTIFICATE` entry in the security directory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WinCertificate {
    pub length: u32,
    pub revision: u16,
    pub certificate_type: u16,
}

const _: () = assert!(size_of::<DosHeader>() == 64);
const _: () = assert!(size_of::<FileHeader>() == 20);
const _: () = assert!(size_of::<OptionalHeader64>() == 240);
const _: () = assert!(size_of::<SectionHeader>() == 40);

/// How strict header validation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Any PE32+ image.
    Pe64,
    /// PE32+ with the boot-application subsystem.
    BootApplication,
}

/// Bytes written by [`PeImage::load_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub header_bytes: usize,
    pub section_bytes: usize,
    pub sections: usize,
}

fn read_at<T: FromBytes>(bytes: &[u8], offset: usize) -> Result<T, FormatError> {
    bytes
        .get(offset..)
        .and_then(|tail| T::read_from_prefix(tail).ok())
        .map(|(value, _)| value)
        .ok_or(FormatError::Truncated {
            offset,
            needed: size_of::<T>(),
        })
}

/// A validated view of a PE32+ file.
#[derive(Debug, Clone, Copy)]
pub struct PeImage<'a> {
    bytes: &'a [u8],
    file: FileHeader,
    optional: OptionalHeader64,
    section_table: &'a [u8],
}

impl<'a> PeImage<'a> {
    pub fn parse(bytes: &'a [u8], validation: Validation) -> Result<Self, FormatError> {
        let dos: DosHeader = read_at(bytes, 0)?;
        if dos.e_magic != IMAGE_DOS_SIGNATURE {
            return Err(FormatError::BadDosMagic(dos.e_magic));
        }

        let nt = dos.e_lfanew as usize;
        let signature: u32 = read_at(bytes, nt)?;
        if signature != IMAGE_NT_SIGNATURE {
            return Err(FormatError::BadNtSignature(signature));
        }

        let file_offset = nt + size_of::<u32>();
        let file: FileHeader = read_at(bytes, file_offset)?;

        let optional_offset = file_offset + size_of::<FileHeader>();
        // Magic first so a PE32 image is reported as such rather than truncated.
        let magic: u16 = read_at(bytes, optional_offset)?;
        if magic != IMAGE_NT_OPTIONAL_HDR64_MAGIC {
            return Err(FormatError::BadOptionalMagic(magic));
        }
        let optional: OptionalHeader64 = read_at(bytes, optional_offset)?;

        if validation == Validation::BootApplication
            && optional.subsystem != IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION
        {
            return Err(FormatError::NotBootApplication(optional.subsystem));
        }

        let table_offset = optional_offset + usize::from(file.size_of_optional_header);
        let table_len = usize::from(file.number_of_sections) * size_of::<SectionHeader>();
        let section_table = table_offset
            .checked_add(table_len)
            .and_then(|end| bytes.get(table_offset..end))
            .ok_or(FormatError::Truncated {
                offset: table_offset,
                needed: table_len,
            })?;

        Ok(Self {
            bytes,
            file,
            optional,
            section_table,
        })
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.file
    }

    pub fn optional_header(&self) -> &OptionalHeader64 {
        &self.optional
    }

    pub fn size_of_headers(&self) -> usize {
        self.optional.size_of_headers as usize
    }

    pub fn size_of_image(&self) -> usize {
        self.optional.size_of_image as usize
    }

    pub fn entry_point(&self) -> u32 {
        self.optional.address_of_entry_point
    }

    pub fn sections(&self) -> impl Iterator<Item = SectionHeader> + 'a {
        self.section_table
            .chunks_exact(size_of::<SectionHeader>())
            .filter_map(|raw| SectionHeader::read_from_bytes(raw).ok())
    }

    /// The security directory entry, header-checked.
    pub fn certificate(&self) -> Result<&'a [u8], FormatError> {
        if (self.optional.number_of_rva_and_sizes as usize) <= IMAGE_DIRECTORY_ENTRY_SECURITY {
            return Err(FormatError::MissingCertificate);
        }
        let dir = self.optional.data_directory[IMAGE_DIRECTORY_ENTRY_SECURITY];
        if dir.size == 0 {
            return Err(FormatError::MissingCertificate);
        }

        // The security directory holds a file offset, not an RVA.
        let start = dir.virtual_address as usize;
        let len = dir.size as usize;
        let data = start
            .checked_add(len)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or(FormatError::Truncated { offset: start, needed: len })?;

        let cert: WinCertificate = read_at(data, 0)?;
        debug!(
            "cert at {:#x} size {:#x}: len={:#x} rev={:#x} type={:#x}",
            start, len, cert.length, cert.revision, cert.certificate_type
        );
        if cert.revision != WIN_CERT_REVISION_2_0
            || cert.certificate_type != WIN_CERT_TYPE_PKCS_SIGNED_DATA
        {
            return Err(FormatError::BadCertificate {
                revision: cert.revision,
                kind: cert.certificate_type,
            });
        }

        Ok(data)
    }

    /// Copy headers and section raw data into `destination`.
    ///
    /// Every range is checked before the first byte is written, so a failure
    /// leaves `destination` untouched.
    pub fn load_into(&self, destination: &mut [u8]) -> Result<LoadReport, FormatError> {
        let limit = destination.len();
        let headers = self.size_of_headers();
        if headers > limit {
            return Err(FormatError::HeadersOutOfBounds { size: headers, limit });
        }
        if headers > self.bytes.len() {
            return Err(FormatError::Truncated { offset: 0, needed: headers });
        }

        for (index, section) in self.sections().enumerate() {
            let raw = u64::from(section.size_of_raw_data);
            let src = u64::from(section.pointer_to_raw_data);
            if src + raw > self.bytes.len() as u64 {
                return Err(FormatError::RawDataOutOfFile {
                    index,
                    start: src,
                    end: src + raw,
                });
            }
            let dst = u64::from(section.virtual_address);
            if dst + raw > limit as u64 {
                return Err(FormatError::SectionOutOfBounds {
                    index,
                    start: dst,
                    end: dst + raw,
                    limit,
                });
            }
        }

        destination[..headers].copy_from_slice(&self.bytes[..headers]);
        let mut report = LoadReport {
            header_bytes: headers,
            ..LoadReport::default()
        };

        for section in self.sections() {
            let raw = section.size_of_raw_data as usize;
            let src = section.pointer_to_raw_data as usize;
            let dst = section.virtual_address as usize;
            debug!(
                "section {:<8} {:#010x} <- file {:#x} ({:#x} bytes)",
                section.name(),
                dst,
                src,
                raw
            );
            destination[dst..dst + raw].copy_from_slice(&self.bytes[src..src + raw]);
            report.section_bytes += raw;
            report.sections += 1;
        }

        Ok(report)
    }
}

/// Check that `bytes` looks like a loadable applet.
pub fn validate(bytes: &[u8], validation: Validation) -> Result<(), FormatError> {
    PeImage::parse(bytes, validation).map(|_| ())
}

/// Validate `bytes` and copy it into `destination`.
pub fn load(
    bytes: &[u8],
    destination: &mut [u8],
    validation: Validation,
) -> Result<LoadReport, FormatError> {
    PeImage::parse(bytes, validation)?.load_into(destination)
}

/// Locate the embedded signature blob.
pub fn extract_certificate(bytes: &[u8]) -> Result<&[u8], FormatError> {
    PeImage::parse(bytes, Validation::Pe64)?.certificate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SyntheticApplet;

    fn applet() -> Vec<u8> {
        SyntheticApplet::new()
            .section(".text", 0x1000, &[0xaa; 0x300])
            .section(".data", 0x3000, &[0xbb; 0x80])
            .build()
    }

    #[test]
    fn accepts_a_boot_application() {
        let bytes = applet();
        let image = PeImage::parse(&bytes, Validation::BootApplication).unwrap();
        assert_eq!(image.sections().count(), 2);
        assert_eq!(image.optional_header().subsystem, IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION);
    }

    #[test]
    fn subsystem_is_only_checked_when_asked() {
        let bytes = SyntheticApplet::new().subsystem(10).build();
        assert_eq!(
            validate(&bytes, Validation::BootApplication),
            Err(FormatError::NotBootApplication(10))
        );
        assert_eq!(validate(&bytes, Validation::Pe64), Ok(()));
    }

    #[test]
    fn rejects_pe32() {
        let mut bytes = applet();
        let magic_offset = SyntheticApplet::NT_OFFSET + 4 + 20;
        bytes[magic_offset..magic_offset + 2].copy_from_slice(&0x10bu16.to_le_bytes());
        assert_eq!(
            validate(&bytes, Validation::Pe64),
            Err(FormatError::BadOptionalMagic(0x10b))
        );
    }

    #[test]
    fn truncated_files_are_format_errors() {
        let bytes = applet();
        assert!(matches!(
            validate(&bytes[..0x90], Validation::Pe64),
            Err(FormatError::Truncated { .. })
        ));
        assert!(matches!(validate(&[], Validation::Pe64), Err(FormatError::Truncated { .. })));
    }

    #[test]
    fn load_places_sections_at_their_virtual_address() {
        let bytes = applet();
        let mut dest = vec![0u8; 0x4000];

        let report = load(&bytes, &mut dest, Validation::BootApplication).unwrap();

        assert_eq!(report.sections, 2);
        assert_eq!(report.section_bytes, 0x380);
        assert_eq!(&dest[..2], b"MZ");
        assert!(dest[0x1000..0x1300].iter().all(|&b| b == 0xaa));
        assert_eq!(dest[0x1300], 0);
        assert!(dest[0x3000..0x3080].iter().all(|&b| b == 0xbb));
    }

    #[test]
    fn oversized_section_fails_without_writing() {
        let bytes = SyntheticApplet::new()
            .section(".text", 0x1000, &[0xaa; 0x100])
            .section(".big", 0x1f80, &[0xcc; 0x100])
            .build();
        let mut dest = vec![0x5au8; 0x2000];

        let err = load(&bytes, &mut dest, Validation::BootApplication).unwrap_err();

        assert_eq!(
            err,
            FormatError::SectionOutOfBounds {
                index: 1,
                start: 0x1f80,
                end: 0x2080,
                limit: 0x2000
            }
        );
        assert!(dest.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn certificate_is_returned_in_place() {
        let payload = [0x30u8, 0x82, 0x01, 0x02, 0x03];
        let bytes = SyntheticApplet::new().certificate(0x200, 2, &payload).build();

        let cert = extract_certificate(&bytes).unwrap();

        assert_eq!(cert.len(), 8 + payload.len());
        assert_eq!(&cert[8..], &payload);
        let offset = cert.as_ptr() as usize - bytes.as_ptr() as usize;
        assert_eq!(&bytes[offset..offset + cert.len()], cert);
    }

    #[test]
    fn certificate_type_is_checked() {
        let bytes = SyntheticApplet::new().certificate(0x100, 2, &[1, 2, 3]).build();
        assert_eq!(
            extract_certificate(&bytes),
            Err(FormatError::BadCertificate { revision: 0x100, kind: 2 })
        );

        let bytes = SyntheticApplet::new().without_certificate().build();
        assert_eq!(extract_certificate(&bytes), Err(FormatError::MissingCertificate));
    }
}

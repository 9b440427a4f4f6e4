//! The ELF program loader.
//!
//! Materializes a process image into a target address space from the PT_LOAD
//! segments of a 32-bit little-endian ELF executable. The accepted dialect is
//! deliberately narrow: segments are placed by `p_paddr` (the boot ELFs are
//! linked for identity-like placement), there is no dynamic linking, no
//! relocation and no interpreter.

use elf::{abi::PT_LOAD, endian::LittleEndian, ElfBytes};

use vmm::{kernel_space, AddressSpace, Protection, VirtualAddress, PAGE_SIZE};

use crate::errno::Errno;

/// Loads the ELF image in `image` into `space`.
///
/// Each PT_LOAD segment is reserved in the target space, zeroed over its full
/// memory size and then overlaid with its file contents, so BSS (the span
/// between file size and memory size) reads back as zero. The copy goes
/// through a temporary window mapped into the kernel address space onto the
/// target's freshly allocated frames.
///
/// Returns the user-mode entry point.
pub fn load(image: &[u8], space: &mut AddressSpace) -> Result<VirtualAddress, Errno> {
    let elf = ElfBytes::<LittleEndian>::minimal_parse(image).map_err(|_| Errno::NoExec)?;
    let segments = elf.segments().ok_or(Errno::NoExec)?;

    for header in segments.iter().filter(|s| s.p_type == PT_LOAD) {
        if header.p_memsz == 0 {
            continue;
        }

        let paddr = header.p_paddr as usize;
        let base = VirtualAddress::new(paddr).align_down(PAGE_SIZE);
        let offset = paddr - base.as_usize();

        let mem_size = header.p_memsz as usize;
        let size = (mem_size + offset).next_multiple_of(PAGE_SIZE);

        space
            .map_memory_at(
                base,
                size,
                Protection::READ | Protection::WRITE | Protection::EXEC,
            )
            .map_err(map_failure)?;

        let file_start = header.p_offset as usize;
        let file_size = header.p_filesz as usize;
        let contents = image
            .get(file_start..file_start + file_size)
            .ok_or(Errno::NoExec)?;

        let mut kernel = kernel_space().lock();
        let window = kernel
            .map_from(space, base, size, Protection::WRITE)
            .map_err(map_failure)?;
        kernel
            .fill_bytes(window + offset, mem_size, 0)
            .map_err(map_failure)?;
        kernel
            .write_bytes(window + offset, contents)
            .map_err(map_failure)?;
        kernel.unmap_physical(window, size);
    }

    Ok(VirtualAddress::new(elf.ehdr.e_entry as usize))
}

fn map_failure(err: vmm::MapError) -> Errno {
    match err {
        vmm::MapError::OutOfMemory => Errno::NoMem,
        // A segment that collides with an earlier mapping is a malformed
        // image as far as the loader is concerned.
        vmm::MapError::AlreadyMapped | vmm::MapError::NotMapped => Errno::NoExec,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use vmm::DirectMap;

    fn setup() {
        if !DirectMap::is_installed() {
            DirectMap::hosted(0x10000).install();
            vmm::init_kernel_space();
        }
    }

    const EHDR_SIZE: usize = 52;
    const PHDR_SIZE: usize = 32;

    struct Segment {
        offset: u32,
        paddr: u32,
        file_size: u32,
        mem_size: u32,
    }

    /// Builds a minimal 32-bit little-endian ELF executable image.
    pub(crate) fn build_elf(entry: u32, segments: &[Segment], payload: &[u8]) -> Vec<u8> {
        let mut image = Vec::new();

        // e_ident
        image.extend_from_slice(&[0x7F, b'E', b'L', b'F']);
        image.push(1); // ELFCLASS32
        image.push(1); // ELFDATA2LSB
        image.push(1); // EV_CURRENT
        image.extend_from_slice(&[0; 9]);

        image.extend_from_slice(&2u16.to_le_bytes()); // e_type: ET_EXEC
        image.extend_from_slice(&3u16.to_le_bytes()); // e_machine: EM_386
        image.extend_from_slice(&1u32.to_le_bytes()); // e_version
        image.extend_from_slice(&entry.to_le_bytes()); // e_entry
        image.extend_from_slice(&(EHDR_SIZE as u32).to_le_bytes()); // e_phoff
        image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        image.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
        image.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
        image.extend_from_slice(&(segments.len() as u16).to_le_bytes()); // e_phnum
        image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(image.len(), EHDR_SIZE);

        for segment in segments {
            image.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
            image.extend_from_slice(&segment.offset.to_le_bytes()); // p_offset
            image.extend_from_slice(&segment.paddr.to_le_bytes()); // p_vaddr
            image.extend_from_slice(&segment.paddr.to_le_bytes()); // p_paddr
            image.extend_from_slice(&segment.file_size.to_le_bytes()); // p_filesz
            image.extend_from_slice(&segment.mem_size.to_le_bytes()); // p_memsz
            image.extend_from_slice(&5u32.to_le_bytes()); // p_flags: R+X
            image.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes()); // p_align
        }

        image.extend_from_slice(payload);
        image
    }

    /// Builds an image with one PT_LOAD segment whose contents are `payload`.
    pub(crate) fn build_simple_elf(entry: u32, paddr: u32, mem_size: u32, payload: &[u8]) -> Vec<u8> {
        let offset = (EHDR_SIZE + PHDR_SIZE) as u32;
        build_elf(
            entry,
            &[Segment {
                offset,
                paddr,
                file_size: payload.len() as u32,
                mem_size,
            }],
            payload,
        )
    }

    #[test]
    fn loads_segment_and_zeroes_bss() {
        setup();

        // One PT_LOAD with a deliberately unaligned load address: the low
        // bits become the in-page offset. mem_size > file_size, so the tail
        // must read back as zero.
        let payload: Vec<u8> = (1..=(PAGE_SIZE as u8)).collect();
        let paddr = 0x4000 + 4;
        let mem_size = (PAGE_SIZE * 2) as u32;
        let image = build_simple_elf(paddr, paddr, mem_size, &payload);

        let mut space = AddressSpace::new();
        let entry = load(&image, &mut space).unwrap();
        assert_eq!(entry.as_usize(), paddr as usize);

        // The file contents landed at the load address.
        let mut contents = vec![0u8; payload.len()];
        space
            .read_bytes(VirtualAddress::new(paddr as usize), &mut contents)
            .unwrap();
        assert_eq!(contents, payload);

        // BSS reads back as zero.
        let bss_len = mem_size as usize - payload.len();
        let mut bss = vec![0xAAu8; bss_len];
        space
            .read_bytes(
                VirtualAddress::new(paddr as usize + payload.len()),
                &mut bss,
            )
            .unwrap();
        assert!(bss.iter().all(|&b| b == 0));

        // The reserved range is alignUp(mem_size + offset) pages; the page
        // past it is unmapped.
        let base = VirtualAddress::new(0x4000);
        let reserved = (mem_size as usize + 4).next_multiple_of(PAGE_SIZE);
        assert!(space.translate(base).is_some());
        assert!(space.translate(base + (reserved - 1)).is_some());
        assert!(space.translate(base + reserved).is_none());
    }

    #[test]
    fn returns_entry_point() {
        setup();
        let image = build_simple_elf(0x5008, 0x5000, 8, b"\x90\x90\x90\x90\x90\x90\x90\x90");

        let mut space = AddressSpace::new();
        let entry = load(&image, &mut space).unwrap();
        assert_eq!(entry.as_usize(), 0x5008);
    }

    #[test]
    fn rejects_garbage_image() {
        setup();
        let mut space = AddressSpace::new();
        assert_eq!(load(b"not an elf", &mut space), Err(Errno::NoExec));
        assert!(space.is_empty());
    }

    #[test]
    fn rejects_truncated_segment_contents() {
        setup();
        // file_size runs past the end of the image.
        let image = build_elf(
            0x5000,
            &[Segment {
                offset: (EHDR_SIZE + PHDR_SIZE) as u32,
                paddr: 0x5000,
                file_size: 0x100,
                mem_size: 0x100,
            }],
            b"short",
        );

        let mut space = AddressSpace::new();
        assert_eq!(load(&image, &mut space), Err(Errno::NoExec));
    }

    #[test]
    fn window_is_torn_down_after_load() {
        setup();
        let image = build_simple_elf(0x6000, 0x6000, 8, b"12345678");

        let mut space = AddressSpace::new();
        load(&image, &mut space).unwrap();

        // The kernel space accepted and released the window: a fresh mapping
        // there succeeds again.
        let mut kernel = kernel_space().lock();
        let window = kernel
            .map_from(&space, VirtualAddress::new(0x6000), 8, Protection::READ)
            .unwrap();
        let mut buf = [0u8; 8];
        kernel.read_bytes(window, &mut buf).unwrap();
        assert_eq!(&buf, b"12345678");
        kernel.unmap_physical(window, 8);
    }
}

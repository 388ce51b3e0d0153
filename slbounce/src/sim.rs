//! Host-side stand-ins for the privileged parts: a scripted secure monitor,
//! a page allocator backed by the global allocator and a PE builder.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::vec::Vec;

use zerocopy::{FromBytes, IntoBytes};

use crate::arch::{Platform, SmcResponse, TrampolineInfo};
use crate::config::PAGE_SIZE;
use crate::error::AllocationError;
use crate::launch::TzArgs;
use crate::memory::PageAllocator;
use crate::pe::{
    DataDirectory, DosHeader, FileHeader, OptionalHeader64, SectionHeader, WinCertificate,
    IMAGE_DIRECTORY_ENTRY_SECURITY, IMAGE_DOS_SIGNATURE, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
    IMAGE_NT_SIGNATURE, IMAGE_NUMBEROF_DIRECTORY_ENTRIES, IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION,
};
use crate::recovery::{self, RecoveryContext, CONTEXT_BYTES};
use crate::smc::{SmcParams, SMC_SL_ID};

/// How the simulated monitor answers the next SMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Status(u64),
    /// Zero the parameter page, like a monitor that unmaps it, then answer.
    ZeroBlock(u64),
    /// Jump to the trampoline advertised in the TZ block.
    Bounce,
    Extended([u64; 7]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmcCall {
    pub fid: u32,
    pub args: [u64; 6],
    /// Parameter block as the monitor saw it, for secure-launch calls.
    pub block: Option<SmcParams>,
    /// What the block pointed at when the call was made.
    pub memory: Option<MonitorView>,
    pub armed: bool,
}

/// Copies of the regions reachable from a secure-launch block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorView {
    /// `pe_data[..pe_size]`.
    pub image: Vec<u8>,
    /// `arg_data[..arg_size]`: the TZ block and everything it describes.
    pub args: Vec<u8>,
    /// `boot_params[..boot_params_size]` from the TZ block.
    pub boot_params: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    Reset,
    PowerOff,
    Spin,
}

#[repr(C, align(4096))]
struct TrampolinePage([u8; PAGE_SIZE]);

static TRAMPOLINE_PAGE: TrampolinePage = TrampolinePage([0; PAGE_SIZE]);

/// Scripted secure monitor. Halts record themselves and then panic.
#[derive(Debug)]
pub struct SimPlatform {
    el: Cell<u8>,
    replies: RefCell<VecDeque<Reply>>,
    calls: RefCell<Vec<SmcCall>>,
    flushes: RefCell<Vec<(u64, u64)>>,
    halted: Cell<Option<Halt>>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            el: Cell::new(1),
            replies: RefCell::new(VecDeque::new()),
            calls: RefCell::new(Vec::new()),
            flushes: RefCell::new(Vec::new()),
            halted: Cell::new(None),
        }
    }

    pub fn at_el(el: u8) -> Self {
        let platform = Self::new();
        platform.el.set(el);
        platform
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.replies.borrow_mut().extend(replies);
    }

    pub fn calls(&self) -> Vec<SmcCall> {
        self.calls.borrow().clone()
    }

    pub fn flushes(&self) -> Vec<(u64, u64)> {
        self.flushes.borrow().clone()
    }

    pub fn halted(&self) -> Option<Halt> {
        self.halted.get()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.borrow().len()
    }

    fn next_reply(&self, fid: u32) -> Reply {
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unscripted SMC {fid:#x}"))
    }

    fn record(&self, fid: u32, args: [u64; 6], armed: bool) {
        let block = if fid == SMC_SL_ID && args[0] != 0 {
            // SAFETY: secure-launch calls carry the address of a live SMC block.
            Some(unsafe { read_block(args[0]) })
        } else {
            None
        };
        // SAFETY: a stamped block points at live control blocks.
        let memory = block.as_ref().and_then(|b| unsafe { read_view(b) });
        self.calls.borrow_mut().push(SmcCall {
            fid,
            args,
            block,
            memory,
            armed,
        });
    }

    fn halt(&self, how: Halt) -> ! {
        self.halted.set(Some(how));
        panic!("simulated platform halt: {how:?}");
    }
}

unsafe fn read_block(addr: u64) -> SmcParams {
    let bytes = std::slice::from_raw_parts(addr as *const u8, SmcParams::SIZE);
    SmcParams::read_from_bytes(bytes).unwrap_or_default()
}

unsafe fn copy_out(addr: u64, len: u64) -> Vec<u8> {
    std::slice::from_raw_parts(addr as *const u8, len as usize).to_vec()
}

unsafe fn read_view(block: &SmcParams) -> Option<MonitorView> {
    if block.pe_data == 0 || block.arg_data == 0 {
        return None;
    }
    let args = copy_out(block.arg_data, block.arg_size);
    let (tz, _) = TzArgs::read_from_prefix(&args).ok()?;
    if tz.boot_params == 0 {
        return None;
    }
    Some(MonitorView {
        image: copy_out(block.pe_data, block.pe_size),
        boot_params: copy_out(tz.boot_params, u64::from(tz.boot_params_size)),
        args,
    })
}

unsafe fn zero_block(addr: u64) {
    std::ptr::write_bytes(addr as *mut u8, 0, SmcParams::SIZE);
}

/// Follow SMC block → TZ block → `tb_data` like the trampoline does.
unsafe fn trampoline_context(block: u64) -> u64 {
    let params = read_block(block);
    let bytes = std::slice::from_raw_parts(params.arg_data as *const u8, TzArgs::SIZE);
    TzArgs::read_from_bytes(bytes)
        .map(|tz| tz.tb_data.recovery_context)
        .unwrap_or(0)
}

impl Platform for SimPlatform {
    fn current_el(&self) -> u8 {
        self.el.get()
    }

    fn clean_dcache_range(&self, start: u64, len: u64) {
        self.flushes.borrow_mut().push((start, len));
    }

    fn smc(&self, fid: u32, args: [u64; 3]) -> u64 {
        self.smc_ext(fid, [args[0], args[1], args[2], 0, 0, 0]).status()
    }

    fn smc_ext(&self, fid: u32, args: [u64; 6]) -> SmcResponse {
        self.record(fid, args, false);
        match self.next_reply(fid) {
            Reply::Status(status) => SmcResponse::from([status, 0, 0, 0, 0, 0, 0]),
            Reply::ZeroBlock(status) => {
                // SAFETY: as in `record`.
                unsafe { zero_block(args[0]) };
                SmcResponse::from([status, 0, 0, 0, 0, 0, 0])
            }
            Reply::Extended(regs) => SmcResponse::from(regs),
            Reply::Bounce => panic!("trampoline bounce scripted for an unarmed SMC"),
        }
    }

    fn armed_smc(&self, context: &mut RecoveryContext, fid: u32, args: [u64; 3]) -> u64 {
        for (i, word) in context.words.iter_mut().enumerate() {
            *word = 0x5a5a_0000_0000_0000 | i as u64;
        }
        self.clean_dcache_range(context.addr(), CONTEXT_BYTES as u64);
        self.record(fid, [args[0], args[1], args[2], 0, 0, 0], true);

        match self.next_reply(fid) {
            Reply::Status(status) | Reply::Extended([status, ..]) => status,
            Reply::ZeroBlock(status) => {
                // SAFETY: as in `record`.
                unsafe { zero_block(args[0]) };
                status
            }
            Reply::Bounce => {
                if fid == SMC_SL_ID && args[0] != 0 {
                    // SAFETY: as in `record`; the TZ block is live while armed.
                    let advertised = unsafe { trampoline_context(args[0]) };
                    assert_eq!(advertised, context.addr(), "TZ block points at another context");
                }
                recovery::resume(context).unwrap_or_else(|| panic!("trampoline with empty context"))
            }
        }
    }

    fn trampoline(&self) -> TrampolineInfo {
        let base = &TRAMPOLINE_PAGE as *const TrampolinePage as u64;
        TrampolineInfo {
            entry: base + 0x40,
            base,
            size: PAGE_SIZE as u64,
        }
    }

    fn reset(&self) -> ! {
        self.halt(Halt::Reset)
    }

    fn power_off(&self) -> ! {
        self.halt(Halt::PowerOff)
    }

    fn spin(&self) -> ! {
        self.halt(Halt::Spin)
    }
}

/// Page allocator on top of the global allocator, with failure injection.
#[derive(Debug, Default)]
pub struct SimPages {
    live: RefCell<Vec<(usize, usize)>>,
    allocations: Cell<usize>,
    frees: Cell<usize>,
    fail_at: Cell<Option<usize>>,
}

impl SimPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`th allocation (counting from zero) fail.
    pub fn fail_at(&self, n: usize) {
        self.fail_at.set(Some(n));
    }

    pub fn live(&self) -> usize {
        self.live.borrow().len()
    }

    /// Base and page count of every outstanding allocation.
    pub fn live_spans(&self) -> Vec<(u64, usize)> {
        self.live
            .borrow()
            .iter()
            .map(|&(base, count)| (base as u64, count))
            .collect()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub fn frees(&self) -> usize {
        self.frees.get()
    }

    fn layout(count: usize) -> Option<Layout> {
        Layout::from_size_align(count.checked_mul(PAGE_SIZE)?, PAGE_SIZE).ok()
    }
}

impl PageAllocator for SimPages {
    fn allocate_pages(&self, count: usize) -> Result<NonNull<u8>, AllocationError> {
        let n = self.allocations.get();
        self.allocations.set(n + 1);
        let err = AllocationError { pages: count };
        if self.fail_at.get() == Some(n) || count == 0 {
            return Err(err);
        }
        let layout = Self::layout(count).ok_or(err)?;
        // SAFETY: `layout` has a nonzero size.
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or(err)?;
        self.live.borrow_mut().push((base.as_ptr() as usize, count));
        Ok(base)
    }

    unsafe fn free_pages(&self, base: NonNull<u8>, count: usize) {
        let mut live = self.live.borrow_mut();
        let at = live
            .iter()
            .position(|&entry| entry == (base.as_ptr() as usize, count))
            .unwrap_or_else(|| panic!("freeing unknown pages {:p} x {}", base, count));
        live.swap_remove(at);
        self.frees.set(self.frees.get() + 1);
        if let Some(layout) = Self::layout(count) {
            alloc::dealloc(base.as_ptr(), layout);
        }
    }
}

impl Drop for SimPages {
    fn drop(&mut self) {
        for (base, count) in self.live.get_mut().drain(..) {
            if let Some(layout) = Self::layout(count) {
                // SAFETY: handed-over pages are still ours on the host.
                unsafe { alloc::dealloc(base as *mut u8, layout) };
            }
        }
    }
}

/// Builds small PE32+ files shaped like a signed boot application.
#[derive(Debug, Clone)]
pub struct SyntheticApplet {
    sections: Vec<([u8; 8], u32, Vec<u8>)>,
    subsystem: u16,
    certificate: Option<(u16, u16, Vec<u8>)>,
    size_of_headers: u32,
}

impl Default for SyntheticApplet {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticApplet {
    pub const NT_OFFSET: usize = 0x80;
    pub const FILE_ALIGNMENT: usize = 0x200;

    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            subsystem: IMAGE_SUBSYSTEM_WINDOWS_BOOT_APPLICATION,
            certificate: Some((0x200, 2, vec![0x30; 0x40])),
            size_of_headers: 0x400,
        }
    }

    pub fn section(mut self, name: &str, virtual_address: u32, data: &[u8]) -> Self {
        let mut raw_name = [0u8; 8];
        let len = name.len().min(8);
        raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.sections.push((raw_name, virtual_address, data.to_vec()));
        self
    }

    pub fn subsystem(mut self, subsystem: u16) -> Self {
        self.subsystem = subsystem;
        self
    }

    pub fn certificate(mut self, revision: u16, kind: u16, payload: &[u8]) -> Self {
        self.certificate = Some((revision, kind, payload.to_vec()));
        self
    }

    pub fn without_certificate(mut self) -> Self {
        self.certificate = None;
        self
    }

    pub fn size_of_headers(mut self, size: u32) -> Self {
        self.size_of_headers = size;
        self
    }

    fn align(value: usize, to: usize) -> usize {
        value.div_ceil(to) * to
    }

    pub fn build(&self) -> Vec<u8> {
        let table_offset = Self::NT_OFFSET
            + 4
            + std::mem::size_of::<FileHeader>()
            + std::mem::size_of::<OptionalHeader64>();
        let table_end = table_offset + self.sections.len() * std::mem::size_of::<SectionHeader>();
        let headers = (self.size_of_headers as usize).max(table_end);
        let mut out = vec![0u8; Self::align(headers, Self::FILE_ALIGNMENT)];

        let mut section_headers = Vec::new();
        let mut image_end = 0x1000usize;
        for (name, va, data) in &self.sections {
            let at = out.len();
            out.extend_from_slice(data);
            out.resize(Self::align(out.len(), Self::FILE_ALIGNMENT), 0);
            image_end = image_end.max(Self::align(*va as usize + data.len(), 0x1000));
            section_headers.push(SectionHeader {
                name: *name,
                virtual_size: data.len() as u32,
                virtual_address: *va,
                size_of_raw_data: data.len() as u32,
                pointer_to_raw_data: at as u32,
                characteristics: 0x6000_0020,
                ..SectionHeader::default()
            });
        }

        let mut directories = [DataDirectory::default(); IMAGE_NUMBEROF_DIRECTORY_ENTRIES];
        if let Some((revision, kind, payload)) = &self.certificate {
            out.resize(Self::align(out.len(), 8), 0);
            let at = out.len();
            let cert = WinCertificate {
                length: (8 + payload.len()) as u32,
                revision: *revision,
                certificate_type: *kind,
            };
            out.extend_from_slice(cert.as_bytes());
            out.extend_from_slice(payload);
            directories[IMAGE_DIRECTORY_ENTRY_SECURITY] = DataDirectory {
                virtual_address: at as u32,
                size: cert.length,
            };
        }

        let dos = DosHeader {
            e_magic: IMAGE_DOS_SIGNATURE,
            e_lfanew: Self::NT_OFFSET as u32,
            ..DosHeader::default()
        };
        let file = FileHeader {
            machine: 0xaa64,
            number_of_sections: self.sections.len() as u16,
            size_of_optional_header: std::mem::size_of::<OptionalHeader64>() as u16,
            characteristics: 0x0022,
            ..FileHeader::default()
        };
        let optional = OptionalHeader64 {
            magic: IMAGE_NT_OPTIONAL_HDR64_MAGIC,
            address_of_entry_point: 0x1000,
            image_base: 0x1_4000_0000,
            section_alignment: 0x1000,
            file_alignment: Self::FILE_ALIGNMENT as u32,
            size_of_image: image_end as u32,
            size_of_headers: self.size_of_headers,
            subsystem: self.subsystem,
            number_of_rva_and_sizes: IMAGE_NUMBEROF_DIRECTORY_ENTRIES as u32,
            data_directory: directories,
            ..OptionalHeader64::default()
        };

        let mut put = |at: usize, bytes: &[u8]| out[at..at + bytes.len()].copy_from_slice(bytes);
        put(0, dos.as_bytes());
        put(Self::NT_OFFSET, &IMAGE_NT_SIGNATURE.to_le_bytes());
        put(Self::NT_OFFSET + 4, file.as_bytes());
        put(Self::NT_OFFSET + 4 + std::mem::size_of::<FileHeader>(), optional.as_bytes());
        for (i, header) in section_headers.iter().enumerate() {
            put(table_offset + i * std::mem::size_of::<SectionHeader>(), header.as_bytes());
        }
        out
    }
}

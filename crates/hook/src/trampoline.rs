//! Trampoline code generation
//!
//! Emits relocatable x86-64 for one hook: save RFLAGS and every register the
//! capture sequence clobbers, store the captured value(s) into the channel,
//! restore, replay the stolen bytes verbatim, then `jmp rel32` back to
//! `target + stolen_len`. The capture path is branch-free: the continuous
//! scheme masks the write index instead of dividing, so no instruction's
//! behavior depends on the captured data.
//!
//! Nothing here decodes machine code. The caller supplies a stolen-byte
//! length already verified (offline) to land on an instruction boundary, and
//! the stolen bytes must be position-independent since they execute from the
//! trampoline's address.

use crate::channel::{CaptureScheme, HEADER_LEN, SLOT_LEN};

/// Fixed trampoline region size; building fails rather than exceed it
pub const TRAMPOLINE_CAP: usize = 64;

/// Length of an encoded `jmp rel32`
pub const JMP_REL32_LEN: usize = 5;

/// Minimum stolen-byte length (room for the jump stub)
pub const MIN_STOLEN_LEN: usize = 5;

/// Maximum stolen-byte length
pub const MAX_STOLEN_LEN: usize = 32;

/// x86-64 NOP, used to pad the hook stub
pub const NOP: u8 = 0x90;

/// Error type for trampoline construction
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Stolen length cannot hold the jump stub or exceeds the sane maximum
    #[error("stolen byte length {0} out of range ({MIN_STOLEN_LEN}..={MAX_STOLEN_LEN})")]
    StolenLength(usize),

    /// Continuous slot counts must be powers of two so the writer can mask
    #[error("slot count {0} must be a power of two in 2..=4096")]
    BadSlotCount(u32),

    /// Transactional channels carry at most four words
    #[error("slot words {0} out of range 1..=4")]
    BadSlotWords(u32),

    /// Source register count does not match the scheme
    #[error("capture scheme expects {expected} source register(s), got {got}")]
    CaptureArity { expected: usize, got: usize },

    /// The generated code would not fit the fixed trampoline region
    #[error("trampoline needs {needed} bytes, cap is {cap}")]
    TooLarge { needed: usize, cap: usize },

    /// A relative jump between these addresses cannot be encoded
    #[error("relative jump from {from:x} to {to:x} exceeds rel32 range")]
    JumpOutOfRange { from: usize, to: usize },
}

/// General-purpose source register for a capture.
///
/// RSP has no variant: by the time the capture store runs, the save sequence
/// has already moved the stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GpReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl GpReg {
    /// Low three bits of the register number (ModRM/opcode field)
    fn low3(self) -> u8 {
        self as u8 & 0x7
    }

    /// Whether the register needs a REX extension bit
    fn extended(self) -> bool {
        self as u8 >= 8
    }
}

impl std::str::FromStr for GpReg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rax" => Ok(GpReg::Rax),
            "rcx" => Ok(GpReg::Rcx),
            "rdx" => Ok(GpReg::Rdx),
            "rbx" => Ok(GpReg::Rbx),
            "rbp" => Ok(GpReg::Rbp),
            "rsi" => Ok(GpReg::Rsi),
            "rdi" => Ok(GpReg::Rdi),
            "r8" => Ok(GpReg::R8),
            "r9" => Ok(GpReg::R9),
            "r10" => Ok(GpReg::R10),
            "r11" => Ok(GpReg::R11),
            "r12" => Ok(GpReg::R12),
            "r13" => Ok(GpReg::R13),
            "r14" => Ok(GpReg::R14),
            "r15" => Ok(GpReg::R15),
            other => Err(format!("unknown register '{other}'")),
        }
    }
}

/// Raw instruction emitter for the fixed sequences the builder needs
struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(TRAMPOLINE_CAP),
        }
    }

    fn pushfq(&mut self) {
        self.buf.push(0x9C);
    }

    fn popfq(&mut self) {
        self.buf.push(0x9D);
    }

    fn push(&mut self, reg: GpReg) {
        if reg.extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0x50 + reg.low3());
    }

    fn pop(&mut self, reg: GpReg) {
        if reg.extended() {
            self.buf.push(0x41);
        }
        self.buf.push(0x58 + reg.low3());
    }

    /// mov rcx, src
    fn mov_rcx_from(&mut self, src: GpReg) {
        let rex = 0x48 | if src.extended() { 0x04 } else { 0 };
        self.buf
            .extend_from_slice(&[rex, 0x89, 0xC0 | (src.low3() << 3) | 0x01]);
    }

    /// movabs rax, imm64
    fn mov_rax_imm64(&mut self, imm: u64) {
        self.buf.extend_from_slice(&[0x48, 0xB8]);
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov ebx, dword [rax]
    fn load_ebx_from_rax(&mut self) {
        self.buf.extend_from_slice(&[0x8B, 0x18]);
    }

    /// and ebx, imm32
    fn and_ebx_imm32(&mut self, imm: u32) {
        self.buf.extend_from_slice(&[0x81, 0xE3]);
        self.buf.extend_from_slice(&imm.to_le_bytes());
    }

    /// mov qword [rax + rbx*8 + HEADER_LEN], rcx
    fn store_rcx_slot_indexed(&mut self) {
        self.buf
            .extend_from_slice(&[0x48, 0x89, 0x4C, 0xD8, HEADER_LEN as u8]);
    }

    /// mov qword [rax + disp8], rcx
    fn store_rcx_rax_disp8(&mut self, disp: u8) {
        self.buf.extend_from_slice(&[0x48, 0x89, 0x48, disp]);
    }

    /// inc dword [rax]
    fn inc_dword_at_rax(&mut self) {
        self.buf.extend_from_slice(&[0xFF, 0x00]);
    }

    /// mov dword [rax], 1
    fn set_flag_at_rax(&mut self) {
        self.buf
            .extend_from_slice(&[0xC7, 0x00, 0x01, 0x00, 0x00, 0x00]);
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// jmp rel32 at `from` (address of the opcode byte) targeting `to`
    fn jmp_rel32(&mut self, from: usize, to: usize) -> Result<(), BuildError> {
        let rel = rel32(from, to).ok_or(BuildError::JumpOutOfRange { from, to })?;
        self.buf.push(0xE9);
        self.buf.extend_from_slice(&rel.to_le_bytes());
        Ok(())
    }
}

/// Displacement for a rel32 jump whose opcode byte sits at `from`
fn rel32(from: usize, to: usize) -> Option<i32> {
    let rel = (to as i64).wrapping_sub(from as i64 + JMP_REL32_LEN as i64);
    i32::try_from(rel).ok()
}

/// Builds the machine code for one hook's trampoline.
///
/// Addresses are not assumed up front: [`build`](Self::build) takes the
/// trampoline's actual address once the region has been allocated, because
/// the back-jump is relative to the final byte written.
pub struct TrampolineBuilder<'a> {
    target: usize,
    scheme: CaptureScheme,
    captures: &'a [GpReg],
    stolen: &'a [u8],
}

impl<'a> TrampolineBuilder<'a> {
    pub fn new(
        target: usize,
        scheme: CaptureScheme,
        captures: &'a [GpReg],
        stolen: &'a [u8],
    ) -> Self {
        Self {
            target,
            scheme,
            captures,
            stolen,
        }
    }

    /// Validate the scheme, capture arity and stolen length without
    /// needing allocated addresses. Called by hook sites before any remote
    /// allocation happens.
    pub fn check(&self) -> Result<(), BuildError> {
        if self.stolen.len() < MIN_STOLEN_LEN || self.stolen.len() > MAX_STOLEN_LEN {
            return Err(BuildError::StolenLength(self.stolen.len()));
        }
        match self.scheme {
            CaptureScheme::Continuous { slot_count } => {
                if !slot_count.is_power_of_two() || !(2..=4096).contains(&slot_count) {
                    return Err(BuildError::BadSlotCount(slot_count));
                }
                if self.captures.len() != 1 {
                    return Err(BuildError::CaptureArity {
                        expected: 1,
                        got: self.captures.len(),
                    });
                }
            }
            CaptureScheme::Transactional { slot_words } => {
                if !(1..=4).contains(&slot_words) {
                    return Err(BuildError::BadSlotWords(slot_words));
                }
                if self.captures.len() != slot_words as usize {
                    return Err(BuildError::CaptureArity {
                        expected: slot_words as usize,
                        got: self.captures.len(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Generate the trampoline bytes for the given allocated addresses.
    pub fn build(&self, trampoline_addr: usize, channel_addr: usize) -> Result<Vec<u8>, BuildError> {
        self.check()?;

        let mut asm = Asm::new();
        match self.scheme {
            CaptureScheme::Continuous { slot_count } => {
                self.emit_continuous(&mut asm, channel_addr, slot_count)
            }
            CaptureScheme::Transactional { .. } => self.emit_transactional(&mut asm, channel_addr),
        }

        asm.raw(self.stolen);

        // Resume at the first original instruction after the patched range.
        let resume = self.target + self.stolen.len();
        asm.jmp_rel32(trampoline_addr + asm.buf.len(), resume)?;

        if asm.buf.len() > TRAMPOLINE_CAP {
            return Err(BuildError::TooLarge {
                needed: asm.buf.len(),
                cap: TRAMPOLINE_CAP,
            });
        }
        Ok(asm.buf)
    }

    /// pushfq/push save, capture into `slot[index & mask]`, advance index,
    /// restore. Clobbers rax/rbx/rcx and RFLAGS, all saved.
    fn emit_continuous(&self, asm: &mut Asm, channel_addr: usize, slot_count: u32) {
        asm.pushfq();
        asm.push(GpReg::Rax);
        asm.push(GpReg::Rbx);
        asm.push(GpReg::Rcx);
        // Capture before anything is clobbered; the pushed registers still
        // hold their original values here.
        asm.mov_rcx_from(self.captures[0]);
        asm.mov_rax_imm64(channel_addr as u64);
        asm.load_ebx_from_rax();
        asm.and_ebx_imm32(slot_count - 1);
        asm.store_rcx_slot_indexed();
        asm.inc_dword_at_rax();
        asm.pop(GpReg::Rcx);
        asm.pop(GpReg::Rbx);
        asm.pop(GpReg::Rax);
        asm.popfq();
    }

    /// Push the source registers while they still hold original values,
    /// then pop them into the word slots and set the flag last so the
    /// reader never sees the flag without the words.
    fn emit_transactional(&self, asm: &mut Asm, channel_addr: usize) {
        asm.pushfq();
        asm.push(GpReg::Rax);
        asm.push(GpReg::Rcx);
        for src in self.captures.iter().rev() {
            asm.push(*src);
        }
        asm.mov_rax_imm64(channel_addr as u64);
        for i in 0..self.captures.len() {
            asm.pop(GpReg::Rcx);
            asm.store_rcx_rax_disp8((HEADER_LEN + i * SLOT_LEN) as u8);
        }
        asm.set_flag_at_rax();
        asm.pop(GpReg::Rcx);
        asm.pop(GpReg::Rax);
        asm.popfq();
    }
}

/// Build the hook stub written over the target: `jmp rel32` to the
/// trampoline, padded to `stolen_len` with NOPs.
pub fn jump_stub(target: usize, trampoline_addr: usize, stolen_len: usize) -> Result<Vec<u8>, BuildError> {
    if !(MIN_STOLEN_LEN..=MAX_STOLEN_LEN).contains(&stolen_len) {
        return Err(BuildError::StolenLength(stolen_len));
    }
    let rel = rel32(target, trampoline_addr).ok_or(BuildError::JumpOutOfRange {
        from: target,
        to: trampoline_addr,
    })?;
    let mut stub = Vec::with_capacity(stolen_len);
    stub.push(0xE9);
    stub.extend_from_slice(&rel.to_le_bytes());
    stub.resize(stolen_len, NOP);
    Ok(stub)
}

/// Resolve an encoded `jmp rel32` located at `addr` to its destination
pub fn resolve_jmp_rel32(addr: usize, bytes: &[u8]) -> Option<usize> {
    if bytes.len() < JMP_REL32_LEN || bytes[0] != 0xE9 {
        return None;
    }
    let rel = i32::from_le_bytes(bytes[1..5].try_into().ok()?);
    Some((addr as i64 + JMP_REL32_LEN as i64 + rel as i64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: usize = 0x1400_1000;
    const TRAMP: usize = 0x1410_0000;
    const CHANNEL: usize = 0x2000_0000;

    // mov [rsp+8], rbx; nop: a typical prologue-shaped stolen range
    const STOLEN: [u8; 6] = [0x48, 0x89, 0x5C, 0x24, 0x08, 0x90];

    fn continuous_builder<'a>(captures: &'a [GpReg], stolen: &'a [u8]) -> TrampolineBuilder<'a> {
        TrampolineBuilder::new(
            TARGET,
            CaptureScheme::Continuous { slot_count: 4 },
            captures,
            stolen,
        )
    }

    #[test]
    fn test_back_jump_resolves_to_resume_address() {
        let code = continuous_builder(&[GpReg::Rdi], &STOLEN)
            .build(TRAMP, CHANNEL)
            .unwrap();
        let jmp_at = TRAMP + code.len() - JMP_REL32_LEN;
        let dest = resolve_jmp_rel32(jmp_at, &code[code.len() - JMP_REL32_LEN..]).unwrap();
        assert_eq!(dest, TARGET + STOLEN.len());
    }

    #[test]
    fn test_continuous_byte_layout() {
        let code = continuous_builder(&[GpReg::Rdi], &STOLEN)
            .build(TRAMP, CHANNEL)
            .unwrap();

        let mut expected = vec![
            0x9C, // pushfq
            0x50, 0x53, 0x51, // push rax/rbx/rcx
            0x48, 0x89, 0xF9, // mov rcx, rdi
            0x48, 0xB8, // movabs rax, channel
        ];
        expected.extend_from_slice(&(CHANNEL as u64).to_le_bytes());
        expected.extend_from_slice(&[0x8B, 0x18]); // mov ebx, [rax]
        expected.extend_from_slice(&[0x81, 0xE3, 0x03, 0x00, 0x00, 0x00]); // and ebx, 3
        expected.extend_from_slice(&[0x48, 0x89, 0x4C, 0xD8, 0x08]); // mov [rax+rbx*8+8], rcx
        expected.extend_from_slice(&[0xFF, 0x00]); // inc dword [rax]
        expected.extend_from_slice(&[0x59, 0x5B, 0x58, 0x9D]); // pops + popfq
        expected.extend_from_slice(&STOLEN);

        assert_eq!(&code[..expected.len()], &expected[..]);
        assert_eq!(code.len(), expected.len() + JMP_REL32_LEN);
        assert_eq!(code[expected.len()], 0xE9);
    }

    #[test]
    fn test_stolen_bytes_appended_verbatim() {
        let code = continuous_builder(&[GpReg::R9], &STOLEN)
            .build(TRAMP, CHANNEL)
            .unwrap();
        let start = code.len() - JMP_REL32_LEN - STOLEN.len();
        assert_eq!(&code[start..start + STOLEN.len()], &STOLEN);
    }

    #[test]
    fn test_extended_register_capture_uses_rex() {
        let code = continuous_builder(&[GpReg::R9], &STOLEN)
            .build(TRAMP, CHANNEL)
            .unwrap();
        // mov rcx, r9 => 4C 89 C9, right after pushfq + 3 pushes
        assert_eq!(&code[4..7], &[0x4C, 0x89, 0xC9]);
    }

    #[test]
    fn test_transactional_layout_sets_flag_after_words() {
        let builder = TrampolineBuilder::new(
            TARGET,
            CaptureScheme::Transactional { slot_words: 2 },
            &[GpReg::Rdx, GpReg::R8],
            &STOLEN,
        );
        let code = builder.build(TRAMP, CHANNEL).unwrap();

        let mut expected = vec![
            0x9C, // pushfq
            0x50, 0x51, // push rax, rcx
            0x41, 0x50, // push r8 (second word, pushed first)
            0x52, // push rdx
            0x48, 0xB8, // movabs rax, channel
        ];
        expected.extend_from_slice(&(CHANNEL as u64).to_le_bytes());
        expected.extend_from_slice(&[0x59, 0x48, 0x89, 0x48, 0x08]); // pop rcx; mov [rax+8], rcx
        expected.extend_from_slice(&[0x59, 0x48, 0x89, 0x48, 0x10]); // pop rcx; mov [rax+16], rcx
        expected.extend_from_slice(&[0xC7, 0x00, 0x01, 0x00, 0x00, 0x00]); // flag last
        expected.extend_from_slice(&[0x59, 0x58, 0x9D]); // pop rcx, pop rax, popfq
        expected.extend_from_slice(&STOLEN);

        assert_eq!(&code[..expected.len()], &expected[..]);
    }

    #[test]
    fn test_save_restore_symmetry() {
        let code = continuous_builder(&[GpReg::Rsi], &STOLEN)
            .build(TRAMP, CHANNEL)
            .unwrap();
        // pushfq/push prefix mirrored by pop/popfq before the stolen bytes
        assert_eq!(&code[..4], &[0x9C, 0x50, 0x53, 0x51]);
        let stolen_at = code.len() - JMP_REL32_LEN - STOLEN.len();
        assert_eq!(&code[stolen_at - 4..stolen_at], &[0x59, 0x5B, 0x58, 0x9D]);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let short = [0x90u8; 4];
        assert!(matches!(
            continuous_builder(&[GpReg::Rdi], &short).build(TRAMP, CHANNEL),
            Err(BuildError::StolenLength(4))
        ));

        let builder = TrampolineBuilder::new(
            TARGET,
            CaptureScheme::Continuous { slot_count: 6 },
            &[GpReg::Rdi],
            &STOLEN,
        );
        assert!(matches!(
            builder.build(TRAMP, CHANNEL),
            Err(BuildError::BadSlotCount(6))
        ));

        let builder = TrampolineBuilder::new(
            TARGET,
            CaptureScheme::Transactional { slot_words: 2 },
            &[GpReg::Rdx],
            &STOLEN,
        );
        assert!(matches!(
            builder.build(TRAMP, CHANNEL),
            Err(BuildError::CaptureArity {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_out_of_reach_trampoline_fails() {
        // Trampoline more than 2 GiB away from the resume address
        let far = TARGET + 0x1_0000_0000;
        let err = continuous_builder(&[GpReg::Rdi], &STOLEN)
            .build(far, CHANNEL)
            .unwrap_err();
        assert!(matches!(err, BuildError::JumpOutOfRange { .. }));
    }

    #[test]
    fn test_oversized_stolen_range_rejected() {
        let big = [0x90u8; 33];
        assert!(matches!(
            continuous_builder(&[GpReg::Rdi], &big).build(TRAMP, CHANNEL),
            Err(BuildError::StolenLength(33))
        ));
    }

    #[test]
    fn test_over_cap_fails_too_large() {
        // 28 stolen bytes plus the fixed continuous overhead exceeds the cap
        let stolen = [0x90u8; 28];
        let err = continuous_builder(&[GpReg::Rdi], &stolen)
            .build(TRAMP, CHANNEL)
            .unwrap_err();
        assert!(matches!(err, BuildError::TooLarge { cap: TRAMPOLINE_CAP, .. }));
    }

    #[test]
    fn test_jump_stub_shape() {
        let stub = jump_stub(TARGET, TRAMP, 8).unwrap();
        assert_eq!(stub.len(), 8);
        assert_eq!(stub[0], 0xE9);
        assert_eq!(&stub[5..], &[NOP, NOP, NOP]);
        assert_eq!(resolve_jmp_rel32(TARGET, &stub).unwrap(), TRAMP);
    }

    #[test]
    fn test_register_name_parsing() {
        assert_eq!("rdi".parse::<GpReg>().unwrap(), GpReg::Rdi);
        assert_eq!("R15".parse::<GpReg>().unwrap(), GpReg::R15);
        assert!("rsp".parse::<GpReg>().is_err());
        assert!("xmm0".parse::<GpReg>().is_err());
    }
}

//! 32-bit Interrupt Descriptor Table, PIC remap, PIT programming, and the
//! exception/IRQ/syscall dispatch core (`spec.md §4.4`, §5, §7). Grounded on
//! `original_source/core/interrupts.cpp` (`DoHandleInterrupt`/
//! `DoHandleException`, PIC remap byte sequence, EOI/secondary-EOI logic)
//! and `core/KernelSymbolResolver.cpp` (`PrintStackTrace`). Reshaped from the
//! teacher's named-field-per-vector, x86_64 16-byte-gate
//! `InterruptDescriptorTable` to a `[Gate; 256]` array of classic 32-bit
//! 8-byte gates — full vector coverage makes a per-vector field
//! impractical, and a flat table is what `original_source/` itself uses.
pub mod gdt;
pub mod tss;

use crate::interrupts::gdt::KERNEL_CODE_SELECTOR;
use crate::io_port::{io_wait, IoPort};
use crate::sync::InterruptGuard;
use core::arch::global_asm;
use spin::Mutex;

const IDT_ENTRY_COUNT: usize = 256;
const IDT_INTERRUPT_GATE: u8 = 0xE;
const IDT_PRESENT_RING0: u8 = 0x8E; // present, ring 0, 32-bit interrupt gate
const IDT_PRESENT_RING3: u8 = 0xEE; // same, but callable from ring 3 (syscall gates)

pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

/// Vector the master PIC's IRQ0 (timer) is remapped to.
pub const IRQ_BASE: u8 = 0x20;
pub const TIMER_VECTOR: u8 = IRQ_BASE;
pub const SYSCALL_VECTOR: u8 = 0x80;
pub const GUI_SYSCALL_VECTOR: u8 = 0x81;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_BASE_FREQUENCY: u32 = 1_193_182;

/// The register snapshot built by the common trampoline before calling into
/// Rust, in the order the assembly actually pushes them (lowest address
/// first): `pusha` registers, then the four data-segment selectors, then
/// the software-pushed vector/error-code pair. `eip`/`cs`/`eflags` (and, on
/// a ring-3→ring-0 transition, `useresp`/`ss`) follow immediately above
/// this struct on the stack; they are read by [`CpuContext::iret_frame`]
/// rather than named here, since their presence depends on which ring the
/// interrupt was taken from (`spec.md §3`).
#[repr(C)]
pub struct CpuContext {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub(crate) _esp_ignored_by_pusha: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub vector: u32,
    pub error_code: u32,
}

impl CpuContext {
    /// `(eip, cs, eflags)` as pushed by the CPU itself. Valid unconditionally.
    pub fn iret_frame(&self) -> (u32, u32, u32) {
        let tail = unsafe { (self as *const CpuContext).add(1) as *const u32 };
        unsafe { (tail.read(), tail.add(1).read(), tail.add(2).read()) }
    }

    /// `(user_esp, user_ss)`, present only when `cs`'s RPL is 3.
    pub fn user_stack(&self) -> Option<(u32, u32)> {
        let (_, cs, _) = self.iret_frame();
        if cs & 0x3 != 3 {
            return None;
        }
        let tail = unsafe { (self as *const CpuContext).add(1) as *const u32 };
        unsafe { Some((tail.add(3).read(), tail.add(4).read())) }
    }
}

/// What happens when a given vector fires, replacing virtual-dispatch
/// handler objects with a plain sum type (design note, `spec.md §9`): a
/// `dyn Handler` trait object would need boxing and a vtable call from
/// inside the trampoline's tiny stack frame, for a closed, small set of
/// cases that's simpler as an enum match.
#[derive(Clone, Copy)]
pub enum Handler {
    /// No handler registered; acknowledge (if an IRQ) and return.
    Ignore,
    /// A fixed Rust function pointer, e.g. an exception handler.
    FixedFn(fn(&mut CpuContext) -> *mut CpuContext),
    /// Timer tick: hands off to the scheduler's `schedule()`.
    Scheduler,
    /// General syscall gate (`int 0x80`).
    Syscall,
    /// GUI/external syscall gate (`int 0x81`).
    GuiSyscall,
    /// A relocatable driver's registered interrupt handler, by driver id.
    Driver(u32),
}

static HANDLERS: Mutex<[Handler; IDT_ENTRY_COUNT]> = Mutex::new([Handler::Ignore; IDT_ENTRY_COUNT]);

/// Registers `handler` for `vector`. Used by driver loading (`spec.md §4.10`)
/// to wire a relocatable driver's IRQ handler in after `init()` has already
/// built the IDT.
pub fn set_handler(vector: u8, handler: Handler) {
    let _guard = InterruptGuard::new();
    HANDLERS.lock()[vector as usize] = handler;
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct Gate {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl Gate {
    const fn null() -> Self {
        Gate { offset_low: 0, selector: 0, zero: 0, type_attr: 0, offset_high: 0 }
    }

    fn new(handler: usize, selector: u16, type_attr: u8) -> Self {
        Gate {
            offset_low: (handler & 0xFFFF) as u16,
            selector,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static mut IDT: [Gate; IDT_ENTRY_COUNT] = [Gate::null(); IDT_ENTRY_COUNT];


unsafe extern "C" { fn isr_stub_0(); }
unsafe extern "C" { fn isr_stub_1(); }
unsafe extern "C" { fn isr_stub_2(); }
unsafe extern "C" { fn isr_stub_3(); }
unsafe extern "C" { fn isr_stub_4(); }
unsafe extern "C" { fn isr_stub_5(); }
unsafe extern "C" { fn isr_stub_6(); }
unsafe extern "C" { fn isr_stub_7(); }
unsafe extern "C" { fn isr_stub_8(); }
unsafe extern "C" { fn isr_stub_9(); }
unsafe extern "C" { fn isr_stub_10(); }
unsafe extern "C" { fn isr_stub_11(); }
unsafe extern "C" { fn isr_stub_12(); }
unsafe extern "C" { fn isr_stub_13(); }
unsafe extern "C" { fn isr_stub_14(); }
unsafe extern "C" { fn isr_stub_15(); }
unsafe extern "C" { fn isr_stub_16(); }
unsafe extern "C" { fn isr_stub_17(); }
unsafe extern "C" { fn isr_stub_18(); }
unsafe extern "C" { fn isr_stub_19(); }
unsafe extern "C" { fn isr_stub_20(); }
unsafe extern "C" { fn isr_stub_21(); }
unsafe extern "C" { fn isr_stub_22(); }
unsafe extern "C" { fn isr_stub_23(); }
unsafe extern "C" { fn isr_stub_24(); }
unsafe extern "C" { fn isr_stub_25(); }
unsafe extern "C" { fn isr_stub_26(); }
unsafe extern "C" { fn isr_stub_27(); }
unsafe extern "C" { fn isr_stub_28(); }
unsafe extern "C" { fn isr_stub_29(); }
unsafe extern "C" { fn isr_stub_30(); }
unsafe extern "C" { fn isr_stub_31(); }
unsafe extern "C" { fn isr_stub_32(); }
unsafe extern "C" { fn isr_stub_33(); }
unsafe extern "C" { fn isr_stub_34(); }
unsafe extern "C" { fn isr_stub_35(); }
unsafe extern "C" { fn isr_stub_36(); }
unsafe extern "C" { fn isr_stub_37(); }
unsafe extern "C" { fn isr_stub_38(); }
unsafe extern "C" { fn isr_stub_39(); }
unsafe extern "C" { fn isr_stub_40(); }
unsafe extern "C" { fn isr_stub_41(); }
unsafe extern "C" { fn isr_stub_42(); }
unsafe extern "C" { fn isr_stub_43(); }
unsafe extern "C" { fn isr_stub_44(); }
unsafe extern "C" { fn isr_stub_45(); }
unsafe extern "C" { fn isr_stub_46(); }
unsafe extern "C" { fn isr_stub_47(); }
unsafe extern "C" { fn isr_stub_48(); }
unsafe extern "C" { fn isr_stub_49(); }
unsafe extern "C" { fn isr_stub_50(); }
unsafe extern "C" { fn isr_stub_51(); }
unsafe extern "C" { fn isr_stub_52(); }
unsafe extern "C" { fn isr_stub_53(); }
unsafe extern "C" { fn isr_stub_54(); }
unsafe extern "C" { fn isr_stub_55(); }
unsafe extern "C" { fn isr_stub_56(); }
unsafe extern "C" { fn isr_stub_57(); }
unsafe extern "C" { fn isr_stub_58(); }
unsafe extern "C" { fn isr_stub_59(); }
unsafe extern "C" { fn isr_stub_60(); }
unsafe extern "C" { fn isr_stub_61(); }
unsafe extern "C" { fn isr_stub_62(); }
unsafe extern "C" { fn isr_stub_63(); }
unsafe extern "C" { fn isr_stub_64(); }
unsafe extern "C" { fn isr_stub_65(); }
unsafe extern "C" { fn isr_stub_66(); }
unsafe extern "C" { fn isr_stub_67(); }
unsafe extern "C" { fn isr_stub_68(); }
unsafe extern "C" { fn isr_stub_69(); }
unsafe extern "C" { fn isr_stub_70(); }
unsafe extern "C" { fn isr_stub_71(); }
unsafe extern "C" { fn isr_stub_72(); }
unsafe extern "C" { fn isr_stub_73(); }
unsafe extern "C" { fn isr_stub_74(); }
unsafe extern "C" { fn isr_stub_75(); }
unsafe extern "C" { fn isr_stub_76(); }
unsafe extern "C" { fn isr_stub_77(); }
unsafe extern "C" { fn isr_stub_78(); }
unsafe extern "C" { fn isr_stub_79(); }
unsafe extern "C" { fn isr_stub_80(); }
unsafe extern "C" { fn isr_stub_81(); }
unsafe extern "C" { fn isr_stub_82(); }
unsafe extern "C" { fn isr_stub_83(); }
unsafe extern "C" { fn isr_stub_84(); }
unsafe extern "C" { fn isr_stub_85(); }
unsafe extern "C" { fn isr_stub_86(); }
unsafe extern "C" { fn isr_stub_87(); }
unsafe extern "C" { fn isr_stub_88(); }
unsafe extern "C" { fn isr_stub_89(); }
unsafe extern "C" { fn isr_stub_90(); }
unsafe extern "C" { fn isr_stub_91(); }
unsafe extern "C" { fn isr_stub_92(); }
unsafe extern "C" { fn isr_stub_93(); }
unsafe extern "C" { fn isr_stub_94(); }
unsafe extern "C" { fn isr_stub_95(); }
unsafe extern "C" { fn isr_stub_96(); }
unsafe extern "C" { fn isr_stub_97(); }
unsafe extern "C" { fn isr_stub_98(); }
unsafe extern "C" { fn isr_stub_99(); }
unsafe extern "C" { fn isr_stub_100(); }
unsafe extern "C" { fn isr_stub_101(); }
unsafe extern "C" { fn isr_stub_102(); }
unsafe extern "C" { fn isr_stub_103(); }
unsafe extern "C" { fn isr_stub_104(); }
unsafe extern "C" { fn isr_stub_105(); }
unsafe extern "C" { fn isr_stub_106(); }
unsafe extern "C" { fn isr_stub_107(); }
unsafe extern "C" { fn isr_stub_108(); }
unsafe extern "C" { fn isr_stub_109(); }
unsafe extern "C" { fn isr_stub_110(); }
unsafe extern "C" { fn isr_stub_111(); }
unsafe extern "C" { fn isr_stub_112(); }
unsafe extern "C" { fn isr_stub_113(); }
unsafe extern "C" { fn isr_stub_114(); }
unsafe extern "C" { fn isr_stub_115(); }
unsafe extern "C" { fn isr_stub_116(); }
unsafe extern "C" { fn isr_stub_117(); }
unsafe extern "C" { fn isr_stub_118(); }
unsafe extern "C" { fn isr_stub_119(); }
unsafe extern "C" { fn isr_stub_120(); }
unsafe extern "C" { fn isr_stub_121(); }
unsafe extern "C" { fn isr_stub_122(); }
unsafe extern "C" { fn isr_stub_123(); }
unsafe extern "C" { fn isr_stub_124(); }
unsafe extern "C" { fn isr_stub_125(); }
unsafe extern "C" { fn isr_stub_126(); }
unsafe extern "C" { fn isr_stub_127(); }
unsafe extern "C" { fn isr_stub_128(); }
unsafe extern "C" { fn isr_stub_129(); }
unsafe extern "C" { fn isr_stub_130(); }
unsafe extern "C" { fn isr_stub_131(); }
unsafe extern "C" { fn isr_stub_132(); }
unsafe extern "C" { fn isr_stub_133(); }
unsafe extern "C" { fn isr_stub_134(); }
unsafe extern "C" { fn isr_stub_135(); }
unsafe extern "C" { fn isr_stub_136(); }
unsafe extern "C" { fn isr_stub_137(); }
unsafe extern "C" { fn isr_stub_138(); }
unsafe extern "C" { fn isr_stub_139(); }
unsafe extern "C" { fn isr_stub_140(); }
unsafe extern "C" { fn isr_stub_141(); }
unsafe extern "C" { fn isr_stub_142(); }
unsafe extern "C" { fn isr_stub_143(); }
unsafe extern "C" { fn isr_stub_144(); }
unsafe extern "C" { fn isr_stub_145(); }
unsafe extern "C" { fn isr_stub_146(); }
unsafe extern "C" { fn isr_stub_147(); }
unsafe extern "C" { fn isr_stub_148(); }
unsafe extern "C" { fn isr_stub_149(); }
unsafe extern "C" { fn isr_stub_150(); }
unsafe extern "C" { fn isr_stub_151(); }
unsafe extern "C" { fn isr_stub_152(); }
unsafe extern "C" { fn isr_stub_153(); }
unsafe extern "C" { fn isr_stub_154(); }
unsafe extern "C" { fn isr_stub_155(); }
unsafe extern "C" { fn isr_stub_156(); }
unsafe extern "C" { fn isr_stub_157(); }
unsafe extern "C" { fn isr_stub_158(); }
unsafe extern "C" { fn isr_stub_159(); }
unsafe extern "C" { fn isr_stub_160(); }
unsafe extern "C" { fn isr_stub_161(); }
unsafe extern "C" { fn isr_stub_162(); }
unsafe extern "C" { fn isr_stub_163(); }
unsafe extern "C" { fn isr_stub_164(); }
unsafe extern "C" { fn isr_stub_165(); }
unsafe extern "C" { fn isr_stub_166(); }
unsafe extern "C" { fn isr_stub_167(); }
unsafe extern "C" { fn isr_stub_168(); }
unsafe extern "C" { fn isr_stub_169(); }
unsafe extern "C" { fn isr_stub_170(); }
unsafe extern "C" { fn isr_stub_171(); }
unsafe extern "C" { fn isr_stub_172(); }
unsafe extern "C" { fn isr_stub_173(); }
unsafe extern "C" { fn isr_stub_174(); }
unsafe extern "C" { fn isr_stub_175(); }
unsafe extern "C" { fn isr_stub_176(); }
unsafe extern "C" { fn isr_stub_177(); }
unsafe extern "C" { fn isr_stub_178(); }
unsafe extern "C" { fn isr_stub_179(); }
unsafe extern "C" { fn isr_stub_180(); }
unsafe extern "C" { fn isr_stub_181(); }
unsafe extern "C" { fn isr_stub_182(); }
unsafe extern "C" { fn isr_stub_183(); }
unsafe extern "C" { fn isr_stub_184(); }
unsafe extern "C" { fn isr_stub_185(); }
unsafe extern "C" { fn isr_stub_186(); }
unsafe extern "C" { fn isr_stub_187(); }
unsafe extern "C" { fn isr_stub_188(); }
unsafe extern "C" { fn isr_stub_189(); }
unsafe extern "C" { fn isr_stub_190(); }
unsafe extern "C" { fn isr_stub_191(); }
unsafe extern "C" { fn isr_stub_192(); }
unsafe extern "C" { fn isr_stub_193(); }
unsafe extern "C" { fn isr_stub_194(); }
unsafe extern "C" { fn isr_stub_195(); }
unsafe extern "C" { fn isr_stub_196(); }
unsafe extern "C" { fn isr_stub_197(); }
unsafe extern "C" { fn isr_stub_198(); }
unsafe extern "C" { fn isr_stub_199(); }
unsafe extern "C" { fn isr_stub_200(); }
unsafe extern "C" { fn isr_stub_201(); }
unsafe extern "C" { fn isr_stub_202(); }
unsafe extern "C" { fn isr_stub_203(); }
unsafe extern "C" { fn isr_stub_204(); }
unsafe extern "C" { fn isr_stub_205(); }
unsafe extern "C" { fn isr_stub_206(); }
unsafe extern "C" { fn isr_stub_207(); }
unsafe extern "C" { fn isr_stub_208(); }
unsafe extern "C" { fn isr_stub_209(); }
unsafe extern "C" { fn isr_stub_210(); }
unsafe extern "C" { fn isr_stub_211(); }
unsafe extern "C" { fn isr_stub_212(); }
unsafe extern "C" { fn isr_stub_213(); }
unsafe extern "C" { fn isr_stub_214(); }
unsafe extern "C" { fn isr_stub_215(); }
unsafe extern "C" { fn isr_stub_216(); }
unsafe extern "C" { fn isr_stub_217(); }
unsafe extern "C" { fn isr_stub_218(); }
unsafe extern "C" { fn isr_stub_219(); }
unsafe extern "C" { fn isr_stub_220(); }
unsafe extern "C" { fn isr_stub_221(); }
unsafe extern "C" { fn isr_stub_222(); }
unsafe extern "C" { fn isr_stub_223(); }
unsafe extern "C" { fn isr_stub_224(); }
unsafe extern "C" { fn isr_stub_225(); }
unsafe extern "C" { fn isr_stub_226(); }
unsafe extern "C" { fn isr_stub_227(); }
unsafe extern "C" { fn isr_stub_228(); }
unsafe extern "C" { fn isr_stub_229(); }
unsafe extern "C" { fn isr_stub_230(); }
unsafe extern "C" { fn isr_stub_231(); }
unsafe extern "C" { fn isr_stub_232(); }
unsafe extern "C" { fn isr_stub_233(); }
unsafe extern "C" { fn isr_stub_234(); }
unsafe extern "C" { fn isr_stub_235(); }
unsafe extern "C" { fn isr_stub_236(); }
unsafe extern "C" { fn isr_stub_237(); }
unsafe extern "C" { fn isr_stub_238(); }
unsafe extern "C" { fn isr_stub_239(); }
unsafe extern "C" { fn isr_stub_240(); }
unsafe extern "C" { fn isr_stub_241(); }
unsafe extern "C" { fn isr_stub_242(); }
unsafe extern "C" { fn isr_stub_243(); }
unsafe extern "C" { fn isr_stub_244(); }
unsafe extern "C" { fn isr_stub_245(); }
unsafe extern "C" { fn isr_stub_246(); }
unsafe extern "C" { fn isr_stub_247(); }
unsafe extern "C" { fn isr_stub_248(); }
unsafe extern "C" { fn isr_stub_249(); }
unsafe extern "C" { fn isr_stub_250(); }
unsafe extern "C" { fn isr_stub_251(); }
unsafe extern "C" { fn isr_stub_252(); }
unsafe extern "C" { fn isr_stub_253(); }
unsafe extern "C" { fn isr_stub_254(); }
unsafe extern "C" { fn isr_stub_255(); }

static ISR_STUBS: [usize; IDT_ENTRY_COUNT] = [
    isr_stub_0 as usize,
    isr_stub_1 as usize,
    isr_stub_2 as usize,
    isr_stub_3 as usize,
    isr_stub_4 as usize,
    isr_stub_5 as usize,
    isr_stub_6 as usize,
    isr_stub_7 as usize,
    isr_stub_8 as usize,
    isr_stub_9 as usize,
    isr_stub_10 as usize,
    isr_stub_11 as usize,
    isr_stub_12 as usize,
    isr_stub_13 as usize,
    isr_stub_14 as usize,
    isr_stub_15 as usize,
    isr_stub_16 as usize,
    isr_stub_17 as usize,
    isr_stub_18 as usize,
    isr_stub_19 as usize,
    isr_stub_20 as usize,
    isr_stub_21 as usize,
    isr_stub_22 as usize,
    isr_stub_23 as usize,
    isr_stub_24 as usize,
    isr_stub_25 as usize,
    isr_stub_26 as usize,
    isr_stub_27 as usize,
    isr_stub_28 as usize,
    isr_stub_29 as usize,
    isr_stub_30 as usize,
    isr_stub_31 as usize,
    isr_stub_32 as usize,
    isr_stub_33 as usize,
    isr_stub_34 as usize,
    isr_stub_35 as usize,
    isr_stub_36 as usize,
    isr_stub_37 as usize,
    isr_stub_38 as usize,
    isr_stub_39 as usize,
    isr_stub_40 as usize,
    isr_stub_41 as usize,
    isr_stub_42 as usize,
    isr_stub_43 as usize,
    isr_stub_44 as usize,
    isr_stub_45 as usize,
    isr_stub_46 as usize,
    isr_stub_47 as usize,
    isr_stub_48 as usize,
    isr_stub_49 as usize,
    isr_stub_50 as usize,
    isr_stub_51 as usize,
    isr_stub_52 as usize,
    isr_stub_53 as usize,
    isr_stub_54 as usize,
    isr_stub_55 as usize,
    isr_stub_56 as usize,
    isr_stub_57 as usize,
    isr_stub_58 as usize,
    isr_stub_59 as usize,
    isr_stub_60 as usize,
    isr_stub_61 as usize,
    isr_stub_62 as usize,
    isr_stub_63 as usize,
    isr_stub_64 as usize,
    isr_stub_65 as usize,
    isr_stub_66 as usize,
    isr_stub_67 as usize,
    isr_stub_68 as usize,
    isr_stub_69 as usize,
    isr_stub_70 as usize,
    isr_stub_71 as usize,
    isr_stub_72 as usize,
    isr_stub_73 as usize,
    isr_stub_74 as usize,
    isr_stub_75 as usize,
    isr_stub_76 as usize,
    isr_stub_77 as usize,
    isr_stub_78 as usize,
    isr_stub_79 as usize,
    isr_stub_80 as usize,
    isr_stub_81 as usize,
    isr_stub_82 as usize,
    isr_stub_83 as usize,
    isr_stub_84 as usize,
    isr_stub_85 as usize,
    isr_stub_86 as usize,
    isr_stub_87 as usize,
    isr_stub_88 as usize,
    isr_stub_89 as usize,
    isr_stub_90 as usize,
    isr_stub_91 as usize,
    isr_stub_92 as usize,
    isr_stub_93 as usize,
    isr_stub_94 as usize,
    isr_stub_95 as usize,
    isr_stub_96 as usize,
    isr_stub_97 as usize,
    isr_stub_98 as usize,
    isr_stub_99 as usize,
    isr_stub_100 as usize,
    isr_stub_101 as usize,
    isr_stub_102 as usize,
    isr_stub_103 as usize,
    isr_stub_104 as usize,
    isr_stub_105 as usize,
    isr_stub_106 as usize,
    isr_stub_107 as usize,
    isr_stub_108 as usize,
    isr_stub_109 as usize,
    isr_stub_110 as usize,
    isr_stub_111 as usize,
    isr_stub_112 as usize,
    isr_stub_113 as usize,
    isr_stub_114 as usize,
    isr_stub_115 as usize,
    isr_stub_116 as usize,
    isr_stub_117 as usize,
    isr_stub_118 as usize,
    isr_stub_119 as usize,
    isr_stub_120 as usize,
    isr_stub_121 as usize,
    isr_stub_122 as usize,
    isr_stub_123 as usize,
    isr_stub_124 as usize,
    isr_stub_125 as usize,
    isr_stub_126 as usize,
    isr_stub_127 as usize,
    isr_stub_128 as usize,
    isr_stub_129 as usize,
    isr_stub_130 as usize,
    isr_stub_131 as usize,
    isr_stub_132 as usize,
    isr_stub_133 as usize,
    isr_stub_134 as usize,
    isr_stub_135 as usize,
    isr_stub_136 as usize,
    isr_stub_137 as usize,
    isr_stub_138 as usize,
    isr_stub_139 as usize,
    isr_stub_140 as usize,
    isr_stub_141 as usize,
    isr_stub_142 as usize,
    isr_stub_143 as usize,
    isr_stub_144 as usize,
    isr_stub_145 as usize,
    isr_stub_146 as usize,
    isr_stub_147 as usize,
    isr_stub_148 as usize,
    isr_stub_149 as usize,
    isr_stub_150 as usize,
    isr_stub_151 as usize,
    isr_stub_152 as usize,
    isr_stub_153 as usize,
    isr_stub_154 as usize,
    isr_stub_155 as usize,
    isr_stub_156 as usize,
    isr_stub_157 as usize,
    isr_stub_158 as usize,
    isr_stub_159 as usize,
    isr_stub_160 as usize,
    isr_stub_161 as usize,
    isr_stub_162 as usize,
    isr_stub_163 as usize,
    isr_stub_164 as usize,
    isr_stub_165 as usize,
    isr_stub_166 as usize,
    isr_stub_167 as usize,
    isr_stub_168 as usize,
    isr_stub_169 as usize,
    isr_stub_170 as usize,
    isr_stub_171 as usize,
    isr_stub_172 as usize,
    isr_stub_173 as usize,
    isr_stub_174 as usize,
    isr_stub_175 as usize,
    isr_stub_176 as usize,
    isr_stub_177 as usize,
    isr_stub_178 as usize,
    isr_stub_179 as usize,
    isr_stub_180 as usize,
    isr_stub_181 as usize,
    isr_stub_182 as usize,
    isr_stub_183 as usize,
    isr_stub_184 as usize,
    isr_stub_185 as usize,
    isr_stub_186 as usize,
    isr_stub_187 as usize,
    isr_stub_188 as usize,
    isr_stub_189 as usize,
    isr_stub_190 as usize,
    isr_stub_191 as usize,
    isr_stub_192 as usize,
    isr_stub_193 as usize,
    isr_stub_194 as usize,
    isr_stub_195 as usize,
    isr_stub_196 as usize,
    isr_stub_197 as usize,
    isr_stub_198 as usize,
    isr_stub_199 as usize,
    isr_stub_200 as usize,
    isr_stub_201 as usize,
    isr_stub_202 as usize,
    isr_stub_203 as usize,
    isr_stub_204 as usize,
    isr_stub_205 as usize,
    isr_stub_206 as usize,
    isr_stub_207 as usize,
    isr_stub_208 as usize,
    isr_stub_209 as usize,
    isr_stub_210 as usize,
    isr_stub_211 as usize,
    isr_stub_212 as usize,
    isr_stub_213 as usize,
    isr_stub_214 as usize,
    isr_stub_215 as usize,
    isr_stub_216 as usize,
    isr_stub_217 as usize,
    isr_stub_218 as usize,
    isr_stub_219 as usize,
    isr_stub_220 as usize,
    isr_stub_221 as usize,
    isr_stub_222 as usize,
    isr_stub_223 as usize,
    isr_stub_224 as usize,
    isr_stub_225 as usize,
    isr_stub_226 as usize,
    isr_stub_227 as usize,
    isr_stub_228 as usize,
    isr_stub_229 as usize,
    isr_stub_230 as usize,
    isr_stub_231 as usize,
    isr_stub_232 as usize,
    isr_stub_233 as usize,
    isr_stub_234 as usize,
    isr_stub_235 as usize,
    isr_stub_236 as usize,
    isr_stub_237 as usize,
    isr_stub_238 as usize,
    isr_stub_239 as usize,
    isr_stub_240 as usize,
    isr_stub_241 as usize,
    isr_stub_242 as usize,
    isr_stub_243 as usize,
    isr_stub_244 as usize,
    isr_stub_245 as usize,
    isr_stub_246 as usize,
    isr_stub_247 as usize,
    isr_stub_248 as usize,
    isr_stub_249 as usize,
    isr_stub_250 as usize,
    isr_stub_251 as usize,
    isr_stub_252 as usize,
    isr_stub_253 as usize,
    isr_stub_254 as usize,
    isr_stub_255 as usize,];

const EXCEPTION_VECTOR_COUNT: usize = 0x20;

/// Fills every vector's gate, remaps the PIC, programs the PIT for
/// `crate::config::TIMER_HZ`, and loads `IDTR`. Exception vectors
/// (0x00–0x1F) point at [`dispatch_trampoline`] via the default
/// `Handler::FixedFn(default_exception_handler)`; IRQ vectors default to
/// `Handler::Ignore` until a driver registers one; vector `0x20` defaults
/// to `Handler::Scheduler`; `0x80`/`0x81` default to `Handler::Syscall`/
/// `Handler::GuiSyscall`.
///
/// # Safety
/// Must run exactly once, with interrupts disabled, before `sti`.
pub unsafe fn init() {
    remap_pic();
    program_pit(crate::config::TIMER_HZ);

    let mut handlers = HANDLERS.lock();
    for v in 0..EXCEPTION_VECTOR_COUNT {
        handlers[v] = Handler::FixedFn(default_exception_handler);
    }
    handlers[TIMER_VECTOR as usize] = Handler::Scheduler;
    handlers[SYSCALL_VECTOR as usize] = Handler::Syscall;
    handlers[GUI_SYSCALL_VECTOR as usize] = Handler::GuiSyscall;
    drop(handlers);

    unsafe {
        for v in 0..IDT_ENTRY_COUNT {
            let ring = if v == SYSCALL_VECTOR as usize || v == GUI_SYSCALL_VECTOR as usize {
                IDT_PRESENT_RING3
            } else {
                IDT_PRESENT_RING0
            };
            IDT[v] = Gate::new(ISR_STUBS[v], KERNEL_CODE_SELECTOR, ring);
        }

        let ptr = IdtPointer {
            limit: (core::mem::size_of::<[Gate; IDT_ENTRY_COUNT]>() - 1) as u16,
            base: &raw const IDT as u32,
        };
        core::arch::asm!("lidt [{0}]", in(reg) &ptr, options(nostack));
    }
}

/// PIC remap sequence: cascade-init both PICs, assign vector offsets
/// `0x20`/`0x28`, wire the cascade on IRQ2, select 8086 mode, then unmask
/// everything (drivers mask back down the lines they don't own).
fn remap_pic() {
    let pic1_cmd = IoPort::new(PIC1_COMMAND);
    let pic1_data = IoPort::new(PIC1_DATA);
    let pic2_cmd = IoPort::new(PIC2_COMMAND);
    let pic2_data = IoPort::new(PIC2_DATA);

    pic1_cmd.write_u8(0x11);
    io_wait();
    pic2_cmd.write_u8(0x11);
    io_wait();

    pic1_data.write_u8(IRQ_BASE);
    io_wait();
    pic2_data.write_u8(IRQ_BASE + 8);
    io_wait();

    pic1_data.write_u8(0x04); // tell master PIC there is a slave at IRQ2
    io_wait();
    pic2_data.write_u8(0x02); // tell slave PIC its cascade identity
    io_wait();

    pic1_data.write_u8(0x01); // 8086 mode
    io_wait();
    pic2_data.write_u8(0x01);
    io_wait();

    pic1_data.write_u8(0x00); // unmask all lines
    pic2_data.write_u8(0x00);
}

fn program_pit(hz: u32) {
    let divisor = (PIT_BASE_FREQUENCY / hz) as u16;
    let cmd = IoPort::new(PIT_COMMAND);
    let channel0 = IoPort::new(PIT_CHANNEL0);

    cmd.write_u8(0x36); // channel 0, lo/hi byte access, mode 3 (square wave)
    channel0.write_u8((divisor & 0xFF) as u8);
    channel0.write_u8(((divisor >> 8) & 0xFF) as u8);
}

fn send_eoi(vector: u8) {
    if vector >= IRQ_BASE + 8 {
        IoPort::new(PIC2_COMMAND).write_u8(0x20);
    }
    if vector >= IRQ_BASE {
        IoPort::new(PIC1_COMMAND).write_u8(0x20);
    }
}

/// Called by the assembly trampoline for every vector. Returns the context
/// the CPU should resume with: almost always `context` itself, except when
/// `Handler::Scheduler` hands back a different thread's saved context.
/// Grounded on `original_source/core/interrupts.cpp`'s `DoHandleInterrupt`.
#[unsafe(no_mangle)]
extern "C" fn interrupt_dispatch(context: *mut CpuContext) -> *mut CpuContext {
    let ctx = unsafe { &mut *context };
    let vector = ctx.vector as u8;
    let is_irq = (IRQ_BASE..IRQ_BASE + 16).contains(&vector);

    let handler = HANDLERS.lock()[vector as usize];
    let result = match handler {
        Handler::Ignore => context,
        Handler::FixedFn(f) => f(ctx),
        Handler::Scheduler => crate::scheduler::on_timer_tick(ctx),
        Handler::Syscall => crate::syscalls::dispatch(ctx),
        Handler::GuiSyscall => crate::syscalls::dispatch_gui(ctx),
        Handler::Driver(id) => crate::drivers::dispatch_irq(id, ctx),
    };

    if is_irq {
        send_eoi(vector);
    }
    result
}

/// The architectural exception names, in vector order, for the panic
/// screen (`spec.md §7`).
const EXCEPTION_NAMES: [&str; EXCEPTION_VECTOR_COUNT] = [
    "Divide Error", "Debug Exception", "NMI", "Breakpoint", "Overflow",
    "BOUND Range Exceeded", "Invalid Opcode", "Device Not Available",
    "Double Fault", "Coprocessor Segment Overrun", "Invalid TSS",
    "Segment Not Present", "Stack-Segment Fault", "General Protection",
    "Page Fault", "Reserved", "x87 Floating-Point Error", "Alignment Check",
    "Machine Check", "SIMD Floating-Point Exception", "Virtualization Exception",
    "Control Protection Exception", "Reserved", "Reserved", "Reserved",
    "Reserved", "Reserved", "Reserved", "Reserved", "Reserved", "Reserved", "Reserved",
];

/// What the fatal-exception path does once it has rendered the panic
/// screen: a testable seam (design note, `spec.md §9`) standing in for the
/// original's direct keyboard-controller reset call, so the decision of
/// *whether* to reset can be exercised without actually rebooting under a
/// test harness.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResetIntent {
    RebootViaKeyboardController,
    Halt,
}

/// Default: always reboot, matching `original_source/core/interrupts.cpp`.
/// Overridable for tests via [`set_reset_intent`].
static RESET_INTENT: Mutex<ResetIntent> = Mutex::new(ResetIntent::RebootViaKeyboardController);

pub fn set_reset_intent(intent: ResetIntent) {
    *RESET_INTENT.lock() = intent;
}

fn default_exception_handler(ctx: &mut CpuContext) -> *mut CpuContext {
    let (eip, cs, eflags) = ctx.iret_frame();
    let cr2 = if ctx.vector == 14 { read_cr2() } else { 0 };

    crate::vga_buffer::blue_screen(|w| {
        use core::fmt::Write;
        let name = EXCEPTION_NAMES[ctx.vector as usize];
        let _ = writeln!(w, "KERNEL PANIC: {name} (vector {:#x})", ctx.vector);
        let _ = writeln!(w, "error_code={:#x}  eip={:#x}  cs={:#x}  eflags={:#x}", ctx.error_code, eip, cs, eflags);
        if ctx.vector == 14 {
            let _ = writeln!(w, "cr2={cr2:#x}");
        }
        let _ = writeln!(w, "eax={:#x} ebx={:#x} ecx={:#x} edx={:#x}", ctx.eax, ctx.ebx, ctx.ecx, ctx.edx);
        let _ = writeln!(w, "esi={:#x} edi={:#x} ebp={:#x}", ctx.esi, ctx.edi, ctx.ebp);
        let _ = writeln!(w, "-- stack trace --");
        for (frame_eip, symbol) in crate::symbols::walk_stack(ctx.ebp) {
            let _ = writeln!(w, "  {frame_eip:#010x}  {symbol}");
        }
    });

    match *RESET_INTENT.lock() {
        ResetIntent::Halt => loop {
            crate::hlt();
        },
        ResetIntent::RebootViaKeyboardController => {
            reboot_via_keyboard_controller();
        }
    }
}

fn read_cr2() -> usize {
    let value: usize;
    unsafe { core::arch::asm!("mov {0}, cr2", out(reg) value, options(nostack, preserves_flags)) };
    value
}

/// Pulses the keyboard controller's reset line (port `0x64`, command
/// `0xFE`), per `original_source/core/interrupts.cpp`'s fatal-exception
/// path, once `RESET_INTENT` says to. Also the mechanism `sys_restart`
/// (`spec.md §4.6`) invokes directly, outside any exception.
pub(crate) fn reboot_via_keyboard_controller() -> ! {
    let status_port = IoPort::new(0x64);
    while status_port.read_u8() & 0x02 != 0 {}
    status_port.write_u8(0xFE);
    loop {
        crate::hlt();
    }
}


global_asm!(
    r#"
.altmacro
.macro isr_stub num
.global isr_stub_\num
isr_stub_\num:
.if (\num == 8) || (\num == 10) || (\num == 11) || (\num == 12) || (\num == 13) || (\num == 14) || (\num == 17) || (\num == 21)
    # the CPU already pushed an error code for this vector
.else
    push 0
.endif
    push \num
    jmp isr_common
.endm

.set i, 0
.rept 256
    isr_stub %i
    .set i, i+1
.endr

.section .text
isr_common:
    push gs
    push fs
    push es
    push ds
    pusha

    mov ax, 0x10 # kernel data selector; matches gdt::KERNEL_DATA_SELECTOR
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push esp
    call interrupt_dispatch
    mov esp, eax

    popa
    pop ds
    pop es
    pop fs
    pop gs
    add esp, 8 # drop the software-pushed vector/error_code pair
    iretd
"#
);

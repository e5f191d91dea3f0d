//! Multiboot2 entry trampoline
//!
//! GRUB hands control to `_start` in 32-bit protected mode with the
//! Multiboot2 magic in EAX and the boot information address in EBX.
//! This code checks for long mode, builds the bootstrap identity map
//! (1 GiB of 2 MiB pages), enables paging and jumps into 64-bit `kmain`.

use core::arch::global_asm;

/// Stack size for the boot process (16 KiB)
const BOOT_STACK_SIZE: usize = 16384;

/// Multiboot2 magic number passed by the bootloader in EAX
pub const MULTIBOOT2_ENTRY_MAGIC: u32 = 0x36D7_6289;

// Boot stack in .bss
global_asm!(
    ".section .bss",
    ".align 16",
    "boot_stack_bottom:",
    ".skip {stack_size}",
    "boot_stack_top:",
    stack_size = const BOOT_STACK_SIZE,
);

// Multiboot2 header in its own section, kept by the linker script
global_asm!(
    ".section .multiboot2_header",
    ".align 8",
    "mb2_header_start:",
    "    .long 0xe85250d6",                          // Multiboot2 magic
    "    .long 0",                                   // Architecture: i386
    "    .long mb2_header_end - mb2_header_start",   // Header length
    "    .long -(0xe85250d6 + 0 + (mb2_header_end - mb2_header_start))", // Checksum
    // End tag (required)
    "    .short 0",
    "    .short 0",
    "    .long 8",
    "mb2_header_end:",
);

// Bootstrap page tables (zeroed .bss)
global_asm!(
    ".section .bss",
    ".align 4096",
    "boot_p4_table:",
    "    .skip 4096",
    "boot_p3_table:",
    "    .skip 4096",
    "boot_p2_table:",
    "    .skip 4096",
);

global_asm!(
    ".section .text",
    ".code32",
    ".global _start",
    "_start:",
    // EAX = Multiboot2 magic, EBX = boot info address.
    // Latch them into EDI/ESI before cpuid clobbers EAX/EBX.
    "    mov edi, eax",
    "    mov esi, ebx",
    "    mov esp, offset boot_stack_top",

    "    cmp edi, {magic}",
    "    jne .Lno_multiboot",

    // CPUID support: the ID bit in EFLAGS must be togglable
    "    pushfd",
    "    pop eax",
    "    mov ecx, eax",
    "    xor eax, (1 << 21)",
    "    push eax",
    "    popfd",
    "    pushfd",
    "    pop eax",
    "    push ecx",
    "    popfd",
    "    cmp eax, ecx",
    "    je .Lno_cpuid",

    // Long mode support
    "    mov eax, 0x80000000",
    "    cpuid",
    "    cmp eax, 0x80000001",
    "    jb .Lno_long_mode",
    "    mov eax, 0x80000001",
    "    cpuid",
    "    test edx, (1 << 29)",
    "    jz .Lno_long_mode",

    // Bootstrap identity map: P4[0] -> P3[0] -> P2[0..512] as 2 MiB pages
    "    lea eax, [boot_p3_table]",
    "    or eax, 0x03",
    "    mov dword ptr [boot_p4_table], eax",
    "    lea eax, [boot_p2_table]",
    "    or eax, 0x03",
    "    mov dword ptr [boot_p3_table], eax",
    "    mov ecx, 0",
    ".Lmap_p2_loop:",
    "    mov eax, ecx",
    "    shl eax, 21",
    "    or eax, 0x83",                         // Present + Writable + Huge
    "    lea edx, [boot_p2_table]",
    "    mov dword ptr [edx + ecx*8], eax",
    "    mov dword ptr [edx + ecx*8 + 4], 0",
    "    inc ecx",
    "    cmp ecx, 512",
    "    jne .Lmap_p2_loop",

    // Enable PAE
    "    mov eax, cr4",
    "    or eax, (1 << 5)",
    "    mov cr4, eax",

    // Load bootstrap P4
    "    lea eax, [boot_p4_table]",
    "    mov cr3, eax",

    // EFER: long mode enable + NX enable (the kernel uses NO_EXECUTE)
    "    mov ecx, 0xC0000080",
    "    rdmsr",
    "    or eax, (1 << 8) | (1 << 11)",
    "    wrmsr",

    // Enable paging
    "    mov eax, cr0",
    "    or eax, (1 << 31)",
    "    mov cr0, eax",

    // Far jump into 64-bit code
    "    lgdt [boot_gdt64_pointer]",
    "    push 0x08",
    "    lea eax, [.Llong_mode_start]",
    "    push eax",
    "    retf",

    // Error paths: write a marker to the VGA text buffer and halt
    ".Lno_multiboot:",
    "    mov al, 'M'",
    "    jmp .Lboot_error",
    ".Lno_cpuid:",
    "    mov al, 'C'",
    "    jmp .Lboot_error",
    ".Lno_long_mode:",
    "    mov al, 'L'",
    ".Lboot_error:",
    "    mov dword ptr [0xB8000], 0x4F524F45",
    "    mov dword ptr [0xB8004], 0x4F3A4F52",
    "    mov byte ptr [0xB8008], al",
    "    mov byte ptr [0xB8009], 0x4F",
    ".Lhang32:",
    "    cli",
    "    hlt",
    "    jmp .Lhang32",

    ".code64",
    ".Llong_mode_start:",
    "    mov ax, 0x10",
    "    mov ss, ax",
    "    mov ds, ax",
    "    mov es, ax",
    "    mov fs, ax",
    "    mov gs, ax",
    "    lea rsp, [rip + boot_stack_top]",

    // Zero-extend the latched 32-bit values and hand off:
    // kmain(magic: u64, mb2_addr: u64)
    "    mov edi, edi",
    "    mov esi, esi",
    "    call kmain",
    ".Lhang64:",
    "    cli",
    "    hlt",
    "    jmp .Lhang64",

    magic = const MULTIBOOT2_ENTRY_MAGIC,
);

// Minimal 64-bit GDT for the mode switch; gdt::init installs the real one
global_asm!(
    ".section .rodata",
    ".align 16",
    "boot_gdt64:",
    "    .quad 0",
    "    .quad 0x00AF9A000000FFFF",              // 64-bit code
    "    .quad 0x00AF92000000FFFF",              // data
    "boot_gdt64_pointer:",
    "    .short boot_gdt64_pointer - boot_gdt64 - 1",
    "    .quad boot_gdt64",
);

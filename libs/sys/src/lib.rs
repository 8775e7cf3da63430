#![no_std]

/// Shared `int 0x80` ABI between `mantracore` and userland programs.
///
/// Calling convention: `rax` = command, arguments in `rdi`, `rsi`, `rdx`,
/// `rcx` (in that order), return value in `rax`. Negative `rax` values are
/// errno codes (see `mantracore::error`).
pub mod syscall {
    pub const PRINT: u64 = 1; // (cstr_ptr) -> 0 or err
    pub const GETKEY: u64 = 2; // () -> scancode (blocks until a key is available) or err
    pub const PUTCHAR: u64 = 3; // (byte) -> 0 or err
    pub const MALLOC: u64 = 4; // (size) -> ptr (0 on failure)
    pub const FREE: u64 = 5; // (ptr) -> 0 or err
    pub const EXEC: u64 = 6; // (argv_ptr, argc) -> status or err
    pub const ARGV: u64 = 7; // (out_ptr, out_len) -> bytes_written or err
    pub const EXIT: u64 = 8; // (code) -> does not return
    pub const SUM: u64 = 9; // (a, b) -> a + b
}

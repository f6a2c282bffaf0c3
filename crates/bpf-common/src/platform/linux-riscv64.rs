/// Prefix of the syscall entry points in kallsyms (eg. `__riscv_sys_accept4`).
pub const SYSCALL_PREFIX: &str = "__riscv_";

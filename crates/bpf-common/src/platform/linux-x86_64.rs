/// Prefix of the syscall entry points in kallsyms (eg. `__x64_sys_accept4`).
pub const SYSCALL_PREFIX: &str = "__x64_";

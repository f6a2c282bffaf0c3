/// Prefix of the syscall entry points in kallsyms (eg. `__arm64_sys_accept4`).
pub const SYSCALL_PREFIX: &str = "__arm64_";

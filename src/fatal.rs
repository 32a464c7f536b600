use backtrace::Backtrace;

/// Reports an unrecoverable collector error and aborts the process.
///
/// Invariant violations inside the collector leave the heap in an unknown state, so there is no
/// unwinding: the message and a backtrace go to stderr and the process aborts.
#[cold]
#[inline(never)]
pub fn fatal(msg: &str) -> ! {
    eprintln!("fatal error: {}", msg);
    eprintln!();
    eprintln!("{:?}", Backtrace::new());
    std::process::abort()
}

/// Prints the current backtrace, used by allocation tracing.
pub(crate) fn print_backtrace() {
    eprintln!("{:?}", Backtrace::new());
}

/// A wrapper for the `log` facade that is enabled
/// only when the `debug` feature is enabled.
///
/// The heavy form (`carambolas_debug!(heavy, ...)`) is reserved for
/// per-packet tracing and additionally requires `debug_all`.
#[macro_export]
macro_rules! carambolas_debug {
    ($heavy: ident, $($t: tt)*) => {
        if cfg!(feature="debug") && cfg!(feature="debug_all") {
            log::trace!("[carambolas] {}", format!($($t)*));
        }
    };
    ($($t: tt)*) => {
        if cfg!(feature="debug") {
            log::debug!("[carambolas] {}", format!($($t)*));
        }
    };
}

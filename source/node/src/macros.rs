//! Logging
//!
//! With `defmt-logging`, every level goes straight to the `defmt` macro of
//! the same name. Without it nothing is logged, but the arguments are still
//! evaluated (by reference), so a build with logging runs the same code.

#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! node_log {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {
        defmt::$level!($fmt $(, $arg)*)
    };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! node_log {
    ($level:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let _ = $fmt;
        $( let _ = &$arg; )*
    }};
}

macro_rules! node_trace {
    ($($tt:tt)*) => { node_log!(trace, $($tt)*) };
}

macro_rules! node_debug {
    ($($tt:tt)*) => { node_log!(debug, $($tt)*) };
}

macro_rules! node_info {
    ($($tt:tt)*) => { node_log!(info, $($tt)*) };
}

macro_rules! node_warn {
    ($($tt:tt)*) => { node_log!(warn, $($tt)*) };
}

macro_rules! node_error {
    ($($tt:tt)*) => { node_log!(error, $($tt)*) };
}

macro_rules! node_println {
    ($($tt:tt)*) => { node_log!(println, $($tt)*) };
}

//! Crate internal logging macros.
//!
//! The messages are forwarded to defmt with the `defmt` feature and printed to stdout with the
//! `debug-logs` feature. Without either feature the arguments are only type checked.
#![allow(unused_macros)]

macro_rules! trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::trace!($($arg)*);
        #[cfg(feature = "debug-logs")]
        println!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "debug-logs")))]
        let _ = core::format_args!($($arg)*);
    }};
}

macro_rules! debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::debug!($($arg)*);
        #[cfg(feature = "debug-logs")]
        println!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "debug-logs")))]
        let _ = core::format_args!($($arg)*);
    }};
}

macro_rules! info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::info!($($arg)*);
        #[cfg(feature = "debug-logs")]
        println!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "debug-logs")))]
        let _ = core::format_args!($($arg)*);
    }};
}

macro_rules! warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "defmt")]
        defmt::warn!($($arg)*);
        #[cfg(feature = "debug-logs")]
        println!($($arg)*);
        #[cfg(not(any(feature = "defmt", feature = "debug-logs")))]
        let _ = core::format_args!($($arg)*);
    }};
}

// Logging shim: forwards to defmt when the `defmt` feature is enabled and
// compiles to nothing otherwise, so the library builds and tests on the host.
#![allow(unused_macros)]

#[macro_use]
mod _log {
    macro_rules! trace {
        ($s:literal $(, $x:expr)* $(,)?) => {{
            #[cfg(feature = "defmt")]
            ::defmt::trace!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( &$x, )*);
        }};
    }

    macro_rules! debug {
        ($s:literal $(, $x:expr)* $(,)?) => {{
            #[cfg(feature = "defmt")]
            ::defmt::debug!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( &$x, )*);
        }};
    }

    macro_rules! info {
        ($s:literal $(, $x:expr)* $(,)?) => {{
            #[cfg(feature = "defmt")]
            ::defmt::info!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( &$x, )*);
        }};
    }

    macro_rules! warn_ {
        ($s:literal $(, $x:expr)* $(,)?) => {{
            #[cfg(feature = "defmt")]
            ::defmt::warn!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( &$x, )*);
        }};
    }

    macro_rules! error {
        ($s:literal $(, $x:expr)* $(,)?) => {{
            #[cfg(feature = "defmt")]
            ::defmt::error!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( &$x, )*);
        }};
    }
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use info;
pub(crate) use trace;
pub(crate) use warn_ as warn;

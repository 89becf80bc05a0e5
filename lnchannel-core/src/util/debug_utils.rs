use crate::prelude::*;
use bitcoin::{Address, Network, Script};

/// Debug support for bytes
pub struct DebugBytes<'a>(pub &'a [u8]);
impl<'a> core::fmt::Debug for DebugBytes<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        for i in self.0 {
            write!(f, "{:02x}", i)?;
        }
        Ok(())
    }
}

/// Shows only that a secret is present
pub struct DebugRedacted<'a>(pub &'a [u8]);
impl<'a> core::fmt::Debug for DebugRedacted<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        write!(f, "<{} bytes redacted>", self.0.len())
    }
}

/// Return a debug string for a bitcoin::Script
pub fn script_debug(script: &Script, network: Network) -> String {
    format!(
        "script={} {}={}",
        script.to_hex_string(),
        network,
        match Address::from_script(script, network) {
            Ok(addr) => addr.to_string(),
            Err(_) => "<bad-address>".to_string(),
        },
    )
}

/// Return a scopeguard which debugs args on return unless disabled.
#[macro_export]
macro_rules! scoped_debug_return {
    ( $($arg:tt)* ) => {{
        let should_debug = true;
        ::scopeguard::guard(should_debug, |should_debug| {
            if should_debug {
                if ::log::log_enabled!(::log::Level::Debug) {
                    ::log::debug!(
                        "{} failed: {}",
                        $crate::containing_function!(),
                        $crate::vals_str!($($arg)*),
                    );
                }
            }
        })
    }};
}

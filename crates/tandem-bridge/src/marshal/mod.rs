//! Value marshalling
//!
//! - `to_host`: guest values into host values ([`Bridge::guest_to_host`](crate::Bridge::guest_to_host))
//! - `to_guest`: host values into guest values ([`Bridge::host_to_guest`](crate::Bridge::host_to_guest))
//!
//! Both directions take a `convert` flag. Without it a guest value always
//! crosses as an opaque wrapper, and guest callables built from host
//! closures hand their arguments to the closure unconverted.
//!
//! Missing values:
//!
//! ```text
//! guest None               <-> host NULL
//! tabular NA                -> double NA
//! logical/char NA           -> guest None
//! integer NA               <-> guest int i32::MIN
//! double NA                 -> guest float NaN
//! None or NA in a sequence  -> NA of the collapsed vector's type
//! ```

mod to_guest;
mod to_host;

pub(crate) use to_guest::guest_handle;

/// Host integer range; guest integers outside it become doubles.
/// `i32::MIN` lands on the host's missing integer.
pub(crate) fn fits_host_integer(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_range() {
        assert!(fits_host_integer(0));
        assert!(fits_host_integer(i64::from(i32::MAX)));
        assert!(fits_host_integer(i64::from(tandem_host::NA_INTEGER)));
        assert!(!fits_host_integer(i64::from(i32::MAX) + 1));
        assert!(!fits_host_integer(i64::from(i32::MIN) - 1));
        assert!(!fits_host_integer(1 << 40));
    }
}

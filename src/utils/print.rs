//! Helper macros for logging (console printing).

/// Log TRACE message.
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

/// Log an error string to logger and then return a `LodestoneError`
/// containing the string.
///
/// Example:
/// ```ignore
/// let e = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal) => {{
        $crate::pf_error!($fmt_str);
        Err($crate::utils::LodestoneError::msg($fmt_str))
    }};

    ($fmt_str:literal, $($fmt_arg:tt)*) => {{
        $crate::pf_error!($fmt_str, $($fmt_arg)*);
        Err($crate::utils::LodestoneError::msg(format!(
            $fmt_str,
            $($fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod tests {
    use crate::utils::LodestoneError;

    #[test]
    fn error_no_args() {
        let e: Result<(), LodestoneError> = logged_err!("interesting message");
        assert_eq!(e, Err(LodestoneError::msg("interesting message")));
    }

    #[test]
    fn error_with_args() {
        let e: Result<(), LodestoneError> = logged_err!("got {} to print", 777);
        assert_eq!(e, Err(LodestoneError::msg("got 777 to print")));
    }
}

/// Logs an error operators must be paged on. Wraps `tracing::error!` with
/// `alert = true` and `severity = "critical"`.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        ::tracing::error!(
            alert = true,
            severity = "critical",
            $($arg)*
        )
    };
}

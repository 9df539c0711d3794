#[macro_export]
macro_rules! die {
    ($($arg:tt)*) => {{
        ::log::error!("FATAL: {}", format_args!($($arg)*));
        ::std::process::exit(1);
    }}
}

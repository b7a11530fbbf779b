
#[macro_export]
macro_rules! serial_println {
    ( $fmt:expr, $($arg:tt)* ) => {{
        use $crate::serial_print;
        serial_print!(concat!($fmt, "\n"), $($arg)*);
    }};

    ( $fmt:expr ) => {{
        use $crate::serial_print;
        serial_print!(concat!($fmt, "\n"));
    }};

    () => {{
        use $crate::serial_print;
        serial_print!("\n");
    }};
}

// TODO: if we print the result of a function that also calls print, we have a dead lock
#[macro_export]
macro_rules! serial_print {
    ( $fmt:expr, $($arg:tt)* ) => {{
        $crate::serial::_print(format_args!($fmt, $($arg)*));
    }};

    ( $fmt:expr ) => {{
        $crate::serial::_print(format_args!($fmt));
    }};
}

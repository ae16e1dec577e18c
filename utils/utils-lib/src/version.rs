pub mod macros {
    /// Returns the package description of the calling crate.
    #[macro_export]
    macro_rules! package_description {
        () => {
            env!("CARGO_PKG_DESCRIPTION")
        };
    }

    /// Gets package's version info as a static str.
    #[macro_export]
    macro_rules! version_info_str {
        () => {
            env!("CARGO_PKG_VERSION")
        };
    }

    /// Formats package related information.
    /// This includes the package name and version.
    #[macro_export]
    macro_rules! fmt_package_info {
        () => {{
            format!(
                "{} {} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                $crate::package_description!()
            )
        }};
    }

    /// Prints package related information.
    /// This includes the package name and version.
    #[macro_export]
    macro_rules! print_package_info {
        () => {
            println!("{}", $crate::fmt_package_info!());
        };
    }
}

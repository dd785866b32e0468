pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;131m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
  ____  ____  ____        _               _
 |  _ \|  _ \|  _ \      | |__  _ __ ___ | | _____ _ __
 | |_) | |_) | |_) |_____| '_ \| '__/ _ \| |/ / _ \ '__|
 |  __/|  __/|  __/_____|| |_) | | | (_) |   <  __/ |
 |_|   |_|   |_|         |_.__/|_|  \___/|_|\_\___|_|
"#;
    const APP_DESCRIPTION: &str =
        "Permission Police Protocol broker: arbitrated access to guarded resources over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("PPP_BROKER_BUILD_DATE_UTC"),
        env!("PPP_BROKER_BUILD_COMMIT")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
}
